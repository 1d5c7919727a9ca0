// # Resolution Cache
//
// Namespaced key/value cache with per-entry TTL, staleness detection,
// LRU eviction under a memory-entry cap, and JSON file persistence.
//
// ## Design
//
// - Entries are stored under a SHA-256 hash of `"namespace:identifier"`;
//   the original key is kept on the entry for namespace scans.
// - Eviction is lazy and batched: expired entries are purged on writes,
//   and LRU eviction only runs when a write finds the cache at capacity.
//   There is no background sweep.
// - A single mutex guards the entry map and all counters, so no caller
//   can observe a torn read-modify-write (get+touch, set+evict, ...).
//
// ## Persistence
//
// The on-disk format is a single JSON document:
//
// ```json
// {
//   "entries": [ { "key": "ip_check:public_ip", "value": "...", ... } ],
//   "stats": { "hits": 0, ... },
//   "saved_at": 1736424000.0
// }
// ```
//
// Writes are atomic (temp file + rename). A missing file means an empty
// cache; a corrupt file is logged and treated as empty. Loading never
// fails past the constructor boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Fraction of entries evicted in one LRU round (at least one entry)
const LRU_EVICT_FRACTION: usize = 10;

/// Cache entry categories; each selects a default TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// A resolved public address
    IpResult,
    /// A raw per-source response body
    SourceResponse,
    /// A name lookup result
    DnsLookup,
    /// A performance sample (latency measurements and the like)
    PerformanceData,
}

impl CacheKind {
    /// Built-in default TTL for this kind, in seconds
    pub fn default_ttl(self) -> f64 {
        match self {
            CacheKind::IpResult => 300.0,
            CacheKind::SourceResponse => 180.0,
            CacheKind::DnsLookup => 3600.0,
            CacheKind::PerformanceData => 600.0,
        }
    }
}

/// A single cache entry with access metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Original `"namespace:identifier"` key (kept for namespace scans)
    pub key: String,
    /// Cached payload; the cache is value-agnostic
    pub value: Value,
    /// Creation time, seconds since the epoch
    pub created_at: f64,
    /// Last successful read, seconds since the epoch
    pub last_accessed: f64,
    /// Number of successful reads, starts at 1 on insert
    pub access_count: u64,
    /// Seconds until expiry, measured from `created_at`
    pub ttl: f64,
    /// Entry category
    pub kind: CacheKind,
    /// Free-form metadata (e.g. which source produced the value)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CacheEntry {
    /// Expiry is a pure function of age, independent of access
    pub fn is_expired(&self, now: f64) -> bool {
        now - self.created_at > self.ttl
    }

    /// Stale means approaching expiry: age beyond `ttl * stale_threshold`
    pub fn is_stale(&self, now: f64, stale_threshold: f64) -> bool {
        now - self.created_at > self.ttl * stale_threshold
    }

    /// Namespace portion of the original key
    pub fn namespace(&self) -> &str {
        self.key.split_once(':').map(|(ns, _)| ns).unwrap_or(&self.key)
    }

    /// Identifier portion of the original key
    pub fn identifier(&self) -> &str {
        self.key.split_once(':').map(|(_, id)| id).unwrap_or("")
    }

    fn touch(&mut self, now: f64) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

/// Rolling cache counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub refreshes: u64,
    pub saves: u64,
    pub loads: u64,
}

/// Point-in-time cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Number of entries currently held in memory
    pub memory_entries: usize,
    /// hits / (hits + misses), 0.0 when no reads have happened
    pub hit_rate: f64,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired entries removed
    pub cleaned: usize,
    /// Entries remaining after the pass
    pub remaining: usize,
}

/// Serialized cache file format
#[derive(Debug, Serialize, Deserialize)]
struct CacheFileFormat {
    entries: Vec<CacheEntry>,
    #[serde(default)]
    stats: CacheStats,
    saved_at: f64,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    default_ttl: HashMap<CacheKind, f64>,
}

/// TTL/LRU cache with staleness tracking and file persistence
///
/// One instance is constructed per process and injected into the resolver;
/// there is no global singleton.
#[derive(Debug)]
pub struct Cache {
    file: Option<PathBuf>,
    max_entries: usize,
    stale_threshold: f64,
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// Create a cache from configuration, loading any persisted entries.
    ///
    /// A missing cache file yields an empty cache. A corrupt file is
    /// logged and ignored; this constructor does not fail on load errors.
    pub async fn open(config: &CacheConfig) -> Self {
        let mut default_ttl = HashMap::new();
        if let Some(ttl) = config.ip_result_ttl_secs {
            default_ttl.insert(CacheKind::IpResult, ttl);
        }

        let cache = Self {
            file: config.file.as_ref().map(PathBuf::from),
            max_entries: config.max_entries,
            stale_threshold: config.stale_threshold,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                default_ttl,
            }),
        };

        if let Some(path) = cache.file.clone() {
            cache.load_from(&path).await;
        }

        cache
    }

    fn hash_key(namespace: &str, identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(identifier.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Get a value, touching the entry's access metadata on a hit.
    ///
    /// An expired entry is deleted as a side effect and counted as both a
    /// miss and an eviction.
    pub fn get(&self, namespace: &str, identifier: &str) -> Option<Value> {
        let key = Self::hash_key(namespace, identifier);
        let now = Self::now();

        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        let expired = match inner.entries.get(&key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.remove(&key);
            inner.stats.misses += 1;
            inner.stats.evictions += 1;
            return None;
        }

        let entry = inner.entries.get_mut(&key).expect("entry checked above");
        entry.touch(now);
        let value = entry.value.clone();
        inner.stats.hits += 1;
        tracing::debug!("cache hit for {}:{}", namespace, identifier);
        Some(value)
    }

    /// Insert or overwrite a value.
    ///
    /// Expired entries are purged first; if the cache is still at capacity
    /// the least-recently-accessed ~10% of entries are evicted (at least one).
    pub fn set(
        &self,
        namespace: &str,
        identifier: &str,
        value: Value,
        kind: CacheKind,
        ttl: Option<f64>,
        metadata: Option<HashMap<String, String>>,
    ) {
        let key = Self::hash_key(namespace, identifier);
        let now = Self::now();

        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        let ttl = ttl.unwrap_or_else(|| {
            inner
                .default_ttl
                .get(&kind)
                .copied()
                .unwrap_or_else(|| kind.default_ttl())
        });

        Self::purge_expired(&mut inner, now);

        if inner.entries.len() >= self.max_entries {
            Self::evict_lru(&mut inner);
        }

        let entry = CacheEntry {
            key: format!("{}:{}", namespace, identifier),
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            ttl,
            kind,
            metadata: metadata.unwrap_or_default(),
        };

        inner.entries.insert(key, entry);
        tracing::debug!("cache set for {}:{}, ttl {}s", namespace, identifier, ttl);
    }

    /// Remove one entry (identifier given) or every entry in a namespace.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, namespace: &str, identifier: Option<&str>) -> usize {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        match identifier {
            Some(id) => {
                let key = Self::hash_key(namespace, id);
                if inner.entries.remove(&key).is_some() {
                    inner.stats.invalidations += 1;
                    1
                } else {
                    0
                }
            }
            None => {
                let prefix = format!("{}:", namespace);
                let doomed: Vec<String> = inner
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.key.starts_with(&prefix))
                    .map(|(hash, _)| hash.clone())
                    .collect();

                for hash in &doomed {
                    inner.entries.remove(hash);
                }
                inner.stats.invalidations += doomed.len() as u64;
                doomed.len()
            }
        }
    }

    /// Entries approaching expiry: older than `ttl * stale_threshold` but
    /// not yet expired. Used by the proactive refresh workflow.
    pub fn stale_entries(&self, namespace: Option<&str>) -> Vec<CacheEntry> {
        let now = Self::now();
        let inner = self.inner.lock().expect("cache mutex poisoned");

        inner
            .entries
            .values()
            .filter(|entry| {
                entry.is_stale(now, self.stale_threshold) && !entry.is_expired(now)
            })
            .filter(|entry| match namespace {
                Some(ns) => entry.key.starts_with(&format!("{}:", ns)),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Replace an existing entry's value, touching access metadata.
    ///
    /// When `extend_ttl` is set, `created_at` is reset so the entry gets a
    /// full TTL again. Returns false if the entry is absent.
    pub fn refresh(
        &self,
        namespace: &str,
        identifier: &str,
        new_value: Value,
        extend_ttl: bool,
    ) -> bool {
        let key = Self::hash_key(namespace, identifier);
        let now = Self::now();

        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        let Some(entry) = inner.entries.get_mut(&key) else {
            return false;
        };

        entry.value = new_value;
        entry.touch(now);
        if extend_ttl {
            entry.created_at = now;
        }

        inner.stats.refreshes += 1;
        tracing::debug!("cache refreshed for {}:{}", namespace, identifier);
        true
    }

    /// Remove all entries, counting them as invalidations.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.stats.invalidations += count as u64;
        count
    }

    /// Purge expired entries, then persist the cache.
    pub async fn cleanup(&self) -> CleanupReport {
        let report = {
            let mut inner = self.inner.lock().expect("cache mutex poisoned");
            let before = inner.entries.len();
            Self::purge_expired(&mut inner, Self::now());
            let remaining = inner.entries.len();
            CleanupReport {
                cleaned: before - remaining,
                remaining,
            }
        };

        if let Err(e) = self.save().await {
            tracing::error!("failed to save cache after cleanup: {}", e);
        }

        report
    }

    /// Current statistics snapshot
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        let total = inner.stats.hits + inner.stats.misses;
        let hit_rate = if total > 0 {
            inner.stats.hits as f64 / total as f64
        } else {
            0.0
        };

        CacheSnapshot {
            stats: inner.stats.clone(),
            memory_entries: inner.entries.len(),
            hit_rate,
        }
    }

    /// Stale threshold this cache was configured with
    pub fn stale_threshold(&self) -> f64 {
        self.stale_threshold
    }

    /// Default TTL currently in effect for a kind
    pub fn default_ttl(&self, kind: CacheKind) -> f64 {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        inner
            .default_ttl
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_ttl())
    }

    /// Override the default TTL for a kind
    pub fn set_default_ttl(&self, kind: CacheKind, ttl: f64) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.default_ttl.insert(kind, ttl);
        tracing::debug!("default ttl for {:?} set to {}s", kind, ttl);
    }

    fn purge_expired(inner: &mut CacheInner, now: f64) {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &expired {
            inner.entries.remove(hash);
        }
        inner.stats.evictions += expired.len() as u64;
    }

    fn evict_lru(inner: &mut CacheInner) {
        let mut by_access: Vec<(String, f64)> = inner
            .entries
            .iter()
            .map(|(hash, entry)| (hash.clone(), entry.last_accessed))
            .collect();
        by_access.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let evict_count = std::cmp::max(1, by_access.len() / LRU_EVICT_FRACTION);
        for (hash, _) in by_access.into_iter().take(evict_count) {
            inner.entries.remove(&hash);
            inner.stats.evictions += 1;
        }
    }

    /// Persist all entries and counters to the cache file, atomically.
    ///
    /// A no-op when the cache is memory-only.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.file.clone() else {
            return Ok(());
        };

        let doc = {
            let mut inner = self.inner.lock().expect("cache mutex poisoned");
            inner.stats.saves += 1;
            CacheFileFormat {
                entries: inner.entries.values().cloned().collect(),
                stats: inner.stats.clone(),
                saved_at: Self::now(),
            }
        };

        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::cache(format!("failed to serialize cache: {}", e)))?;

        Self::write_atomic(&path, json.as_bytes()).await?;
        tracing::debug!("cache saved to {}", path.display());
        Ok(())
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::cache(format!(
                    "failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut temp = path.to_path_buf();
        temp.set_extension("tmp");

        {
            let mut file = fs::File::create(&temp).await.map_err(|e| {
                Error::cache(format!("failed to create {}: {}", temp.display(), e))
            })?;
            file.write_all(bytes).await.map_err(|e| {
                Error::cache(format!("failed to write {}: {}", temp.display(), e))
            })?;
            file.flush().await.map_err(|e| {
                Error::cache(format!("failed to flush {}: {}", temp.display(), e))
            })?;
        }

        fs::rename(&temp, path).await.map_err(|e| {
            Error::cache(format!(
                "failed to rename {} to {}: {}",
                temp.display(),
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    async fn load_from(&self, path: &Path) {
        if !path.exists() {
            tracing::debug!("cache file does not exist: {}", path.display());
            return;
        }

        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("failed to read cache file {}: {}", path.display(), e);
                return;
            }
        };

        let doc: CacheFileFormat = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(
                    "cache file {} is corrupt, starting empty: {}",
                    path.display(),
                    e
                );
                return;
            }
        };

        let now = Self::now();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let mut accepted = 0usize;

        for entry in doc.entries {
            if entry.is_expired(now) {
                continue;
            }
            let hash = match entry.key.split_once(':') {
                Some((ns, id)) => Self::hash_key(ns, id),
                None => Self::hash_key(&entry.key, ""),
            };
            inner.entries.insert(hash, entry);
            accepted += 1;
        }

        inner.stats = doc.stats;
        inner.stats.loads += 1;
        tracing::info!(
            "cache loaded from {}: {} entries",
            path.display(),
            accepted
        );
    }
}
