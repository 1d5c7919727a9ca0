// # Resolution Engine
//
// Orchestrates the whole lookup pipeline:
//
// ```text
// caller
//   |
//   v
// CircuitBreaker::execute_with_fallback ----> last known good value
//   |
//   v
// Resolver::resolve_once
//   |  fan-out (concurrent) or walk (sequential), per attempt
//   v
// SourceFetcher x N sources ----> per-source health telemetry
//   |  first valid value in source-list order
//   v
// Cache::set (namespace "ip_check")
// ```
//
// ## Concurrency
//
// Concurrent mode issues one task per source and waits for all of them
// before selecting a winner. Cancelling in-flight requests on first success
// would leave health stats blind to the slower sources, so the engine waits
// and keeps telemetry complete. Winner selection is deterministic: first
// valid value in source-list order, regardless of completion order.
//
// The engine is the single owner of source health; every fetch outcome is
// folded into the source set under one lock in `record_outcome`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerOutcome, CircuitBreaker, CircuitState};
use crate::cache::{Cache, CacheKind, CacheSnapshot};
use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::source::{
    FetchOutcome, SourceConfig, SourceFetcher, default_sources, extract_candidate, is_valid_ip,
    order_for_query,
};

/// Cache namespace for resolved addresses
pub const RESOLUTION_NAMESPACE: &str = "ip_check";

/// Cache identifier for the current public address
pub const RESOLUTION_IDENTIFIER: &str = "public_ip";

/// Metadata key recording which source produced a cached value
const SOURCE_METADATA_KEY: &str = "source";

/// Cache state as exposed to administrative callers
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub enabled: bool,
    /// Default TTL for resolved-address entries, in seconds
    pub ttl: f64,
    pub stale_threshold: f64,
    /// Stale (not yet expired) resolution entries right now
    pub stale_count: usize,
    pub stats: Option<CacheSnapshot>,
}

/// Circuit breaker state as exposed to administrative callers
#[derive(Debug, Clone)]
pub struct BreakerInfo {
    pub enabled: bool,
    pub state: CircuitState,
    pub failure_count: usize,
    pub last_known_value: Option<String>,
}

/// Resilient multi-source resolution engine
///
/// Owns the source set and all health mutation for it, plus an optional
/// cache and an optional circuit breaker. One instance per process, shared
/// behind an `Arc`.
pub struct Resolver {
    fetcher: Arc<dyn SourceFetcher>,
    sources: Mutex<Vec<SourceConfig>>,
    max_retries: usize,
    retry_delay: Duration,
    use_concurrent: bool,
    cache: Option<Arc<Cache>>,
    breaker: Option<CircuitBreaker<String>>,
    last_known_good: Mutex<Option<String>>,
}

impl Resolver {
    /// Create a resolver from configuration.
    ///
    /// When the configuration names no sources, the built-in default set is
    /// installed, so telemetry accumulates for defaults like for any custom
    /// source. The cache is injected by the process entry point; the
    /// `cache.enabled` flag wins over an injected instance.
    pub fn new(
        config: &ResolverConfig,
        fetcher: Arc<dyn SourceFetcher>,
        cache: Option<Arc<Cache>>,
    ) -> Result<Self> {
        config.validate()?;

        let sources = if config.sources.is_empty() {
            default_sources()
        } else {
            config.sources.clone()
        };

        let breaker = config
            .breaker
            .enabled
            .then(|| CircuitBreaker::new(&config.breaker));

        Ok(Self {
            fetcher,
            sources: Mutex::new(sources),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            use_concurrent: config.use_concurrent,
            cache: if config.cache.enabled { cache } else { None },
            breaker,
            last_known_good: Mutex::new(None),
        })
    }

    /// Primary entry point: resolve the current public address.
    ///
    /// With the breaker enabled, resolution runs through it and an open
    /// circuit serves the last known good value without touching the
    /// network. Nothing below this method propagates an error; total
    /// failure with no fallback is `None`.
    pub async fn get_public_ip(&self) -> Option<String> {
        let fallback = self.fallback_value().await;

        match &self.breaker {
            Some(breaker) => {
                let outcome = breaker
                    .execute_with_fallback(|| self.resolve_once(), fallback)
                    .await;
                match outcome {
                    BreakerOutcome::Success(ip) => {
                        self.remember(&ip).await;
                        Some(ip)
                    }
                    BreakerOutcome::Fallback(ip) => {
                        info!("serving fallback address {}", ip);
                        Some(ip)
                    }
                    BreakerOutcome::Exhausted => None,
                }
            }
            None => match self.resolve_once().await {
                Ok(ip) => {
                    self.remember(&ip).await;
                    Some(ip)
                }
                Err(e) => {
                    warn!("resolution failed: {}", e);
                    match fallback {
                        Some(ip) => {
                            info!("serving last known address {}", ip);
                            Some(ip)
                        }
                        None => None,
                    }
                }
            },
        }
    }

    /// Run the multi-source resolution algorithm once, bypassing the
    /// breaker and the fallback chain. `None` means every source failed
    /// on every attempt.
    pub async fn resolve(&self) -> Option<String> {
        self.resolve_once().await.ok()
    }

    async fn resolve_once(&self) -> Result<String> {
        let sources = self.query_order().await;

        for attempt in 1..=self.max_retries {
            let winner = if self.use_concurrent {
                self.attempt_concurrent(&sources).await
            } else {
                self.attempt_sequential(&sources).await
            };

            if let Some((ip, source_name)) = winner {
                debug!("resolved {} via {} on attempt {}", ip, source_name, attempt);
                self.store_result(&ip, &source_name);
                return Ok(ip);
            }

            if attempt < self.max_retries {
                warn!(
                    "all sources failed on attempt {}/{}, retrying in {:?}",
                    attempt, self.max_retries, self.retry_delay
                );
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(Error::Exhausted {
            attempts: self.max_retries,
        })
    }

    /// Snapshot the enabled sources in query order.
    ///
    /// If every configured source is disabled, the built-in list is used
    /// instead; a misconfigured source set should degrade, not dead-end.
    async fn query_order(&self) -> Vec<SourceConfig> {
        let mut enabled: Vec<SourceConfig> = {
            let guard = self.sources.lock().await;
            guard.iter().filter(|s| s.enabled).cloned().collect()
        };

        if enabled.is_empty() {
            warn!("no enabled sources configured, using built-in defaults");
            return default_sources();
        }

        order_for_query(&mut enabled);
        enabled
    }

    /// One concurrent attempt: fan out to every source, wait for all,
    /// record telemetry for all, pick the first valid value in source-list
    /// order.
    async fn attempt_concurrent(&self, sources: &[SourceConfig]) -> Option<(String, String)> {
        let mut handles = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let result = fetch_and_validate(fetcher.as_ref(), &source).await;
                (index, result)
            }));
        }

        let mut outcomes: Vec<(usize, Result<(String, u64)>)> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("fetch task panicked: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let mut winner = None;
        for (index, result) in &outcomes {
            let name = &sources[*index].name;
            self.record_outcome(name, result).await;
            if winner.is_none()
                && let Ok((ip, _)) = result
            {
                winner = Some((ip.clone(), name.clone()));
            }
        }
        winner
    }

    /// One sequential attempt: sources in order, stop at the first valid
    /// value. Sources after the winner are not contacted on that attempt.
    async fn attempt_sequential(&self, sources: &[SourceConfig]) -> Option<(String, String)> {
        for source in sources {
            let result = fetch_and_validate(self.fetcher.as_ref(), source).await;
            self.record_outcome(&source.name, &result).await;
            if let Ok((ip, _)) = result {
                return Some((ip, source.name.clone()));
            }
        }
        None
    }

    /// Fold a fetch result into the named source's health counters.
    ///
    /// All health mutation funnels through here, under the source-set lock,
    /// so concurrent fetches against the same source serialize their
    /// updates. Sources that disappeared from the set mid-flight are
    /// silently skipped.
    async fn record_outcome(&self, source_name: &str, result: &Result<(String, u64)>) {
        let mut guard = self.sources.lock().await;
        let Some(source) = guard.iter_mut().find(|s| s.name == source_name) else {
            return;
        };
        match result {
            Ok((_, elapsed_ms)) => source.health.record_success(*elapsed_ms),
            Err(e) => {
                debug!("source {} failed: {}", source_name, e);
                source.health.record_failure();
            }
        }
    }

    fn store_result(&self, ip: &str, source_name: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let metadata = HashMap::from([(SOURCE_METADATA_KEY.to_string(), source_name.to_string())]);
        cache.set(
            RESOLUTION_NAMESPACE,
            RESOLUTION_IDENTIFIER,
            json!(ip),
            CacheKind::IpResult,
            None,
            Some(metadata),
        );
    }

    async fn remember(&self, ip: &str) {
        let mut guard = self.last_known_good.lock().await;
        match guard.as_deref() {
            Some(previous) if previous == ip => {}
            Some(previous) => {
                info!("public address changed: {} -> {}", previous, ip);
                *guard = Some(ip.to_string());
            }
            None => {
                info!("public address resolved: {}", ip);
                *guard = Some(ip.to_string());
            }
        }
    }

    /// Fallback chain: in-memory last known good, else the cached value.
    /// The cache read covers the first call after a restart, before any
    /// resolution has succeeded in this process.
    async fn fallback_value(&self) -> Option<String> {
        if let Some(ip) = self.last_known_good.lock().await.clone() {
            return Some(ip);
        }
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(RESOLUTION_NAMESPACE, RESOLUTION_IDENTIFIER))
            .and_then(|value| value.as_str().map(str::to_string))
    }

    /// Proactively refresh stale resolution entries before they expire.
    ///
    /// Each stale entry is re-fetched from exactly the source that produced
    /// it, recorded in the entry metadata. Entries whose source has been
    /// removed, renamed, or disabled are skipped without counting as
    /// failures. Returns the number of entries refreshed.
    pub async fn refresh_stale_cache_entries(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };

        let stale = cache.stale_entries(Some(RESOLUTION_NAMESPACE));
        if stale.is_empty() {
            return 0;
        }
        debug!("refreshing {} stale cache entries", stale.len());

        let mut refreshed = 0;
        for entry in stale {
            let Some(source_name) = entry.metadata.get(SOURCE_METADATA_KEY) else {
                continue;
            };

            let source = {
                let guard = self.sources.lock().await;
                guard
                    .iter()
                    .find(|s| &s.name == source_name && s.enabled)
                    .cloned()
            };
            let Some(source) = source else {
                debug!(
                    "skipping stale entry {}: source {} no longer available",
                    entry.key, source_name
                );
                continue;
            };

            let result = fetch_and_validate(self.fetcher.as_ref(), &source).await;
            self.record_outcome(&source.name, &result).await;
            match result {
                Ok((ip, _)) => {
                    if cache.refresh(entry.namespace(), entry.identifier(), json!(ip), true) {
                        refreshed += 1;
                    }
                }
                Err(e) => warn!("stale refresh via {} failed: {}", source.name, e),
            }
        }

        refreshed
    }

    /// Cache state for administrative callers
    pub fn cache_info(&self) -> CacheInfo {
        match &self.cache {
            Some(cache) => CacheInfo {
                enabled: true,
                ttl: cache.default_ttl(CacheKind::IpResult),
                stale_threshold: cache.stale_threshold(),
                stale_count: cache.stale_entries(Some(RESOLUTION_NAMESPACE)).len(),
                stats: Some(cache.snapshot()),
            },
            None => CacheInfo {
                enabled: false,
                ttl: 0.0,
                stale_threshold: 0.0,
                stale_count: 0,
                stats: None,
            },
        }
    }

    /// Invalidate one namespace, or everything when `namespace` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate_cache(&self, namespace: Option<&str>) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        match namespace {
            Some(ns) => cache.invalidate(ns, None),
            None => cache.clear(),
        }
    }

    /// Circuit breaker state for administrative callers
    pub async fn breaker_info(&self) -> BreakerInfo {
        match &self.breaker {
            Some(breaker) => {
                let snap = breaker.snapshot().await;
                BreakerInfo {
                    enabled: true,
                    state: snap.state,
                    failure_count: snap.failure_count,
                    last_known_value: snap.last_known_good,
                }
            }
            None => BreakerInfo {
                enabled: false,
                state: CircuitState::Closed,
                failure_count: 0,
                last_known_value: self.last_known_good.lock().await.clone(),
            },
        }
    }

    /// Force the breaker back to CLOSED. Returns false when disabled.
    pub async fn reset_breaker(&self) -> bool {
        match &self.breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all configured sources with their health telemetry
    pub async fn source_health(&self) -> Vec<SourceConfig> {
        self.sources.lock().await.clone()
    }

    /// Purge expired entries and flush the cache, for process exit
    pub async fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            let report = cache.cleanup().await;
            info!(
                "cache flushed: {} expired entries cleaned, {} remaining",
                report.cleaned, report.remaining
            );
        }
    }
}

/// Fetch one source and validate the result.
///
/// Transport failures (timeout, connection error, non-2xx status) and
/// validation failures (malformed body, missing field, invalid address
/// syntax) are both plain errors here; the engine records them per source
/// and moves on to the next one.
async fn fetch_and_validate(
    fetcher: &dyn SourceFetcher,
    config: &SourceConfig,
) -> Result<(String, u64)> {
    let outcome: FetchOutcome = fetcher.fetch(config).await?;

    if !(200..300).contains(&outcome.status) {
        return Err(Error::source(
            &config.name,
            format!("unexpected status {}", outcome.status),
        ));
    }

    let candidate = extract_candidate(&outcome.body, outcome.content_type.as_deref(), config)
        .ok_or_else(|| Error::validation(&config.name, "no address found in response"))?;

    if !is_valid_ip(&candidate) {
        return Err(Error::validation(
            &config.name,
            format!("invalid address: {}", candidate),
        ));
    }

    Ok((candidate, outcome.elapsed_ms))
}
