//! Configuration types for the resolution engine
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

use crate::source::SourceConfig;

/// Main resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Maximum number of resolution attempts across the source set
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay between attempts (in seconds)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Whether to fan out to all sources concurrently within one attempt
    #[serde(default = "default_use_concurrent")]
    pub use_concurrent: bool,

    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Configured sources; when empty the built-in defaults are used
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl ResolverConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            use_concurrent: default_use_concurrent(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_retries == 0 {
            return Err(crate::Error::config("max_retries must be at least 1"));
        }

        for source in &self.sources {
            source.validate()?;
        }

        self.cache.validate()?;
        self.breaker.validate()?;

        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the cache is consulted and written at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Path to the persistent cache file (None = memory only)
    #[serde(default)]
    pub file: Option<String>,

    /// Maximum number of in-memory entries before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Fraction of the TTL after which an entry is considered stale
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold: f64,

    /// TTL override for resolved-address entries (in seconds)
    #[serde(default)]
    pub ip_result_ttl_secs: Option<f64>,
}

impl CacheConfig {
    /// Validate the cache settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_entries == 0 {
            return Err(crate::Error::config("cache max_entries must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.stale_threshold) {
            return Err(crate::Error::config(
                "cache stale_threshold must be in [0.0, 1.0)",
            ));
        }
        if let Some(ttl) = self.ip_result_ttl_secs
            && ttl <= 0.0
        {
            return Err(crate::Error::config("cache ip_result_ttl_secs must be > 0"));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            file: None,
            max_entries: default_max_entries(),
            stale_threshold: default_stale_threshold(),
            ip_result_ttl_secs: None,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Whether resolution calls go through the circuit breaker
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Cooldown before a half-open probe is allowed (in seconds)
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl BreakerConfig {
    /// Validate the breaker settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.failure_threshold == 0 {
            return Err(crate::Error::config(
                "breaker failure_threshold must be at least 1",
            ));
        }
        if self.recovery_timeout_secs == 0 {
            return Err(crate::Error::config(
                "breaker recovery_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_use_concurrent() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    1000
}

fn default_stale_threshold() -> f64 {
    0.8
}

fn default_failure_threshold() -> usize {
    3
}

fn default_recovery_timeout_secs() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ResolverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_secs, 5);
        assert!(config.use_concurrent);
        assert!(config.cache.enabled);
        assert_eq!(config.breaker.failure_threshold, 3);
    }

    #[test]
    fn zero_retries_rejected() {
        let config = ResolverConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_threshold_must_be_fractional() {
        let config = ResolverConfig {
            cache: CacheConfig {
                stale_threshold: 1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = ResolverConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ResolverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_retries, config.max_retries);
        assert_eq!(back.cache.max_entries, config.cache.max_entries);
    }
}
