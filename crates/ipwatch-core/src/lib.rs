// # ipwatch-core
//
// Core library for resilient public IP resolution.
//
// ## Architecture Overview
//
// This library provides the building blocks for multi-source address
// resolution:
// - **Resolver**: Engine orchestrating fan-out, retries, and telemetry
// - **SourceFetcher**: Trait for the HTTP transport (implemented out of crate)
// - **Cache**: TTL/LRU cache with staleness tracking and file persistence
// - **CircuitBreaker**: Failure-rate guard with last-known-good fallback
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Transport is behind a trait; the engine,
//    cache, and breaker never touch the network directly
// 2. **Never-Throw Surface**: `get_public_ip` degrades through fallbacks
//    instead of propagating errors to callers
// 3. **Library-First**: The daemon is a thin shell over this crate
// 4. **Deterministic Selection**: Winner choice depends on source order,
//    not on network timing

pub mod breaker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod source;

// Re-export core types for convenience
pub use breaker::{BreakerOutcome, CircuitBreaker, CircuitState};
pub use cache::{Cache, CacheEntry, CacheKind, CacheSnapshot, CacheStats};
pub use config::{BreakerConfig, CacheConfig, ResolverConfig};
pub use engine::{BreakerInfo, CacheInfo, RESOLUTION_IDENTIFIER, RESOLUTION_NAMESPACE, Resolver};
pub use error::{Error, Result};
pub use source::{
    FetchOutcome, ResponseFormat, SourceConfig, SourceFetcher, SourceHealth, default_sources,
};
