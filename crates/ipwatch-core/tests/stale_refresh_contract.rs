//! Contract tests: proactive refresh of stale cache entries
//!
//! Constraints verified:
//! - A stale (but not expired) entry is re-fetched from exactly the source
//!   that produced it, recorded in the entry metadata
//! - Sources that did not produce the entry are not contacted
//! - Entries whose source has disappeared from the configuration are
//!   skipped, not treated as failures
//!
//! Cache staleness runs on wall-clock time, so these tests use short real
//! TTLs instead of paused time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ipwatch_core::{Cache, Resolver};
use serde_json::json;

#[tokio::test]
async fn stale_entry_refreshed_from_originating_source_only() {
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .ok("alpha", "203.0.113.1")
            .ok("alpha", "203.0.113.2")
            .ok("beta", "198.51.100.9"),
    );
    let mut config = test_config(vec![text_source("alpha"), text_source("beta")]);
    config.cache.ip_result_ttl_secs = Some(2.0);
    config.cache.stale_threshold = 0.5;

    let cache = Arc::new(Cache::open(&config.cache).await);
    let resolver = Resolver::new(&config, fetcher.clone(), Some(cache.clone())).unwrap();

    // alpha wins and the entry is tagged with its name
    assert_eq!(resolver.resolve().await, Some("203.0.113.1".to_string()));
    assert_eq!(resolver.refresh_stale_cache_entries().await, 0);

    // Past ttl * stale_threshold = 1s the entry is stale but alive
    tokio::time::sleep(Duration::from_millis(1250)).await;
    assert_eq!(resolver.refresh_stale_cache_entries().await, 1);

    assert_eq!(fetcher.calls("alpha"), 2);
    assert_eq!(fetcher.calls("beta"), 0);
    assert_eq!(
        cache.get(
            ipwatch_core::RESOLUTION_NAMESPACE,
            ipwatch_core::RESOLUTION_IDENTIFIER
        ),
        Some(json!("203.0.113.2"))
    );

    // The refresh extended the TTL, so the entry is fresh again
    assert_eq!(resolver.refresh_stale_cache_entries().await, 0);
}

#[tokio::test]
async fn refresh_skips_entries_from_unknown_sources() {
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .ok("alpha", "203.0.113.1")
            .ok("beta", "198.51.100.9"),
    );
    let mut config = test_config(vec![text_source("alpha")]);
    config.cache.ip_result_ttl_secs = Some(2.0);
    config.cache.stale_threshold = 0.5;

    let cache = Arc::new(Cache::open(&config.cache).await);
    let writer = Resolver::new(&config, fetcher.clone(), Some(cache.clone())).unwrap();
    writer.resolve().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1250)).await;

    // Same cache, but the configuration no longer knows "alpha"
    let mut reconfigured = test_config(vec![text_source("beta")]);
    reconfigured.cache.ip_result_ttl_secs = Some(2.0);
    reconfigured.cache.stale_threshold = 0.5;
    let reader = Resolver::new(&reconfigured, fetcher.clone(), Some(cache)).unwrap();

    assert_eq!(reader.refresh_stale_cache_entries().await, 0);
    assert_eq!(fetcher.calls("beta"), 0);
}

#[tokio::test]
async fn refresh_without_cache_is_a_no_op() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let config = test_config(vec![text_source("alpha")]);
    let resolver = Resolver::new(&config, fetcher, None).unwrap();
    assert_eq!(resolver.refresh_stale_cache_entries().await, 0);
}
