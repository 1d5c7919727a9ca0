// # ipwatchd - Public IP Monitoring Daemon
//
// The ipwatchd daemon is a thin integration layer over ipwatch-core. It is
// responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing the runtime and tracing
// 3. Building the resolver with the HTTP transport and the cache
// 4. Running the resolution loop until a shutdown signal arrives
//
// Resolution, caching, retry, and breaker logic all live in ipwatch-core;
// nothing in this binary makes a policy decision.
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Resolution
// - `IPWATCH_CHECK_INTERVAL_SECS`: Seconds between resolutions (default 60)
// - `IPWATCH_REFRESH_INTERVAL_SECS`: Seconds between stale-cache refresh
//   passes (default 60)
// - `IPWATCH_MAX_RETRIES`: Attempts across the source set (default 3)
// - `IPWATCH_RETRY_DELAY_SECS`: Delay between attempts (default 5)
// - `IPWATCH_CONCURRENT`: Fan out to all sources per attempt (default true)
// - `IPWATCH_SOURCES_FILE`: JSON file with custom source definitions
//
// ### Cache
// - `IPWATCH_CACHE_ENABLED`: Consult and write the cache (default true)
// - `IPWATCH_CACHE_FILE`: Path to the persistent cache file
//
// ### Circuit breaker
// - `IPWATCH_BREAKER_ENABLED`: Wrap resolution in the breaker (default true)
//
// ### Logging
// - `IPWATCH_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export IPWATCH_CHECK_INTERVAL_SECS=120
// export IPWATCH_CACHE_FILE=/var/lib/ipwatch/cache.json
// export IPWATCH_SOURCES_FILE=/etc/ipwatch/sources.json
//
// ipwatchd
// ```

use anyhow::Result;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use ipwatch_core::{Cache, Resolver, ResolverConfig, SourceConfig};
use ipwatch_http::HttpFetcher;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum IpwatchExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<IpwatchExitCode> for ExitCode {
    fn from(code: IpwatchExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    check_interval_secs: u64,
    refresh_interval_secs: u64,
    max_retries: usize,
    retry_delay_secs: u64,
    use_concurrent: bool,
    cache_enabled: bool,
    cache_file: Option<String>,
    breaker_enabled: bool,
    sources_file: Option<String>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            check_interval_secs: env::var("IPWATCH_CHECK_INTERVAL_SECS")
                .ok()
                .map(|s| s.parse().unwrap_or(60))
                .unwrap_or(60),
            refresh_interval_secs: env::var("IPWATCH_REFRESH_INTERVAL_SECS")
                .ok()
                .map(|s| s.parse().unwrap_or(60))
                .unwrap_or(60),
            max_retries: env::var("IPWATCH_MAX_RETRIES")
                .ok()
                .map(|s| s.parse().unwrap_or(3))
                .unwrap_or(3),
            retry_delay_secs: env::var("IPWATCH_RETRY_DELAY_SECS")
                .ok()
                .map(|s| s.parse().unwrap_or(5))
                .unwrap_or(5),
            use_concurrent: parse_bool(env::var("IPWATCH_CONCURRENT").ok(), true)?,
            cache_enabled: parse_bool(env::var("IPWATCH_CACHE_ENABLED").ok(), true)?,
            cache_file: env::var("IPWATCH_CACHE_FILE").ok(),
            breaker_enabled: parse_bool(env::var("IPWATCH_BREAKER_ENABLED").ok(), true)?,
            sources_file: env::var("IPWATCH_SOURCES_FILE").ok(),
            log_level: env::var("IPWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Checks numeric ranges, file paths, and the log level before any
    /// component is constructed, so misconfiguration fails fast with an
    /// actionable message.
    fn validate(&self) -> Result<()> {
        if !(10..=86400).contains(&self.check_interval_secs) {
            anyhow::bail!(
                "IPWATCH_CHECK_INTERVAL_SECS must be between 10 and 86400 seconds. Got: {}",
                self.check_interval_secs
            );
        }

        if !(10..=3600).contains(&self.refresh_interval_secs) {
            anyhow::bail!(
                "IPWATCH_REFRESH_INTERVAL_SECS must be between 10 and 3600 seconds. Got: {}",
                self.refresh_interval_secs
            );
        }

        if self.max_retries == 0 || self.max_retries > 10 {
            anyhow::bail!(
                "IPWATCH_MAX_RETRIES must be between 1 and 10. Got: {}",
                self.max_retries
            );
        }

        if !(1..=300).contains(&self.retry_delay_secs) {
            anyhow::bail!(
                "IPWATCH_RETRY_DELAY_SECS must be between 1 and 300 seconds. Got: {}",
                self.retry_delay_secs
            );
        }

        if let Some(ref path) = self.cache_file {
            if path.is_empty() {
                anyhow::bail!("IPWATCH_CACHE_FILE cannot be empty when set");
            }
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "IPWATCH_CACHE_FILE parent directory does not exist: {}. \
                    Create it first: mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        if let Some(ref path) = self.sources_file
            && !std::path::Path::new(path).exists()
        {
            anyhow::bail!(
                "IPWATCH_SOURCES_FILE does not exist: {}. \
                Point it at a JSON file with source definitions.",
                path
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "IPWATCH_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Build the resolver configuration, loading custom sources if a
    /// sources file is given.
    fn resolver_config(&self) -> Result<ResolverConfig> {
        let mut config = ResolverConfig::new();
        config.max_retries = self.max_retries;
        config.retry_delay_secs = self.retry_delay_secs;
        config.use_concurrent = self.use_concurrent;
        config.cache.enabled = self.cache_enabled;
        config.cache.file = self.cache_file.clone();
        config.breaker.enabled = self.breaker_enabled;

        if let Some(ref path) = self.sources_file {
            config.sources = load_sources(path)?;
            info!("loaded {} source(s) from {}", config.sources.len(), path);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a boolean environment value; accepts 1/0, true/false, yes/no.
fn parse_bool(value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref() {
        None => Ok(default),
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!(
                "Invalid boolean value '{}'. Use: 1, 0, true, false, yes, no",
                other
            ),
        },
    }
}

/// Load source definitions from a JSON file.
///
/// Accepts either a bare array of sources or a `{"sources": [...]}`
/// document, the format the cache-style tooling writes.
fn load_sources(path: &str) -> Result<Vec<SourceConfig>> {
    #[derive(serde::Deserialize)]
    struct SourcesFile {
        sources: Vec<SourceConfig>,
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read sources file {}: {}", path, e))?;
    let sources = match serde_json::from_str::<SourcesFile>(&content) {
        Ok(doc) => doc.sources,
        Err(_) => serde_json::from_str::<Vec<SourceConfig>>(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse sources file {}: {}", path, e))?,
    };
    for source in &sources {
        source
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid source in {}: {}", path, e))?;
    }
    Ok(sources)
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return IpwatchExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return IpwatchExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return IpwatchExitCode::ConfigError.into();
    }

    info!("Starting ipwatchd daemon");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return IpwatchExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {}", e);
            IpwatchExitCode::RuntimeError
        } else {
            IpwatchExitCode::CleanShutdown
        }
    })
    .into()
}

/// Run the daemon: build the resolver, then loop until a signal arrives.
async fn run_daemon(config: Config) -> Result<()> {
    let resolver_config = config.resolver_config()?;

    let cache = if resolver_config.cache.enabled {
        Some(Arc::new(Cache::open(&resolver_config.cache).await))
    } else {
        None
    };

    let fetcher = Arc::new(HttpFetcher::new());
    let resolver = Resolver::new(&resolver_config, fetcher, cache)?;

    info!(
        "Resolver ready: {} mode, {} retries, breaker {}",
        if resolver_config.use_concurrent {
            "concurrent"
        } else {
            "sequential"
        },
        resolver_config.max_retries,
        if resolver_config.breaker.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    let mut check = tokio::time::interval(Duration::from_secs(config.check_interval_secs));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut refresh = tokio::time::interval(Duration::from_secs(config.refresh_interval_secs));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = check.tick() => {
                match resolver.get_public_ip().await {
                    Some(ip) => info!("current public address: {}", ip),
                    None => warn!("resolution failed and no fallback is available"),
                }
            }
            _ = refresh.tick() => {
                let refreshed = resolver.refresh_stale_cache_entries().await;
                if refreshed > 0 {
                    info!("refreshed {} stale cache entr(ies)", refreshed);
                }
            }
            signal_name = &mut shutdown => {
                match signal_name {
                    Ok(name) => info!("Received shutdown signal: {}", name),
                    Err(e) => {
                        error!("Signal handler error: {}", e);
                        return Err(e);
                    }
                }
                break;
            }
        }
    }

    info!("Shutting down daemon");
    resolver.shutdown().await;
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

/// Wait for shutdown signals (CTRL-C only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
