// # HTTP Transport
//
// This crate provides the reqwest-based `SourceFetcher` implementation for
// the ipwatch resolution engine.
//
// ## Responsibilities
//
// - One GET per fetch, with the source's timeout and extra headers applied
// - Latency measurement around the full request/body cycle
// - Mapping transport failures (timeout, connection, body read) into
//   per-source errors
//
// Response *interpretation* (JSON vs plain text, field extraction, address
// validation) lives in ipwatch-core; this crate only moves bytes.

use std::time::{Duration, Instant};

use ipwatch_core::{Error, FetchOutcome, Result, SourceConfig, SourceFetcher};

/// User agent sent with every request
const USER_AGENT: &str = concat!("ipwatch/", env!("CARGO_PKG_VERSION"));

/// Connect timeout, separate from the per-source total timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// reqwest-backed fetcher shared by all sources
///
/// One instance per process; reqwest clients pool connections internally,
/// so cloning the client per request would defeat keep-alive.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with connection pooling enabled.
    ///
    /// Per-source timeouts are applied per request, not on the client, so
    /// one client can serve sources with different timeout settings.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<FetchOutcome> {
        let mut request = self
            .client
            .get(&source.url)
            .timeout(Duration::from_secs_f64(source.timeout_secs));

        for (name, value) in &source.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::source(&source.name, format!("request timed out: {}", e))
            } else {
                Error::source(&source.name, format!("request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| Error::source(&source.name, format!("failed to read body: {}", e)))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            "fetched {} ({}): status {}, {} bytes, {}ms",
            source.name,
            source.url,
            status,
            body.len(),
            elapsed_ms
        );

        Ok(FetchOutcome {
            status,
            content_type,
            body,
            elapsed_ms,
        })
    }
}
