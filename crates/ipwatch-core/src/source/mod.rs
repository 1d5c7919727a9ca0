// # Source Model
//
// One `SourceConfig` per external lookup endpoint, with per-source response
// format handling and rolling health telemetry. Health counters are
// per-source telemetry only; they never trip the circuit breaker.
//
// Response parsing is a pure function over `(body, content-type, config)`,
// so it is testable without any network I/O.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// JSON fields probed when no explicit `json_field` is configured
const COMMON_JSON_FIELDS: &[&str] = &["ip", "origin", "address"];

/// How a source's response body is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// JSON body; address taken from `json_field` or a probed common field
    Json,
    /// Trimmed plain-text body
    PlainText,
    /// Decide from the response content-type at runtime
    Auto,
}

impl Default for ResponseFormat {
    fn default() -> Self {
        ResponseFormat::Auto
    }
}

/// Rolling per-source health telemetry
///
/// Updated after every attempt against the source, whether or not the
/// attempt contributed the winning value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceHealth {
    pub success_count: u64,
    pub failure_count: u64,
    /// Latency of the most recent successful fetch
    pub last_response_time_ms: u64,
    /// Moving average latency, weighted toward recent measurements
    pub avg_response_time_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl SourceHealth {
    /// Record a successful fetch and its latency
    pub fn record_success(&mut self, response_time_ms: u64) {
        self.success_count += 1;
        self.last_success = Some(Utc::now());
        self.last_response_time_ms = response_time_ms;

        if self.avg_response_time_ms == 0.0 {
            self.avg_response_time_ms = response_time_ms as f64;
        } else {
            self.avg_response_time_ms =
                self.avg_response_time_ms * 0.8 + response_time_ms as f64 * 0.2;
        }
    }

    /// Record a failed fetch (transport or validation)
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Utc::now());
    }

    /// Success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }

    /// Composite score for adaptive ranking: success rate with a latency
    /// bonus/penalty and a penalty for failures within the last 5 minutes.
    pub fn performance_score(&self) -> f64 {
        let mut score = self.success_rate();
        let avg_secs = self.avg_response_time_ms / 1000.0;

        if avg_secs > 2.0 {
            score -= ((avg_secs - 2.0) * 5.0).min(20.0);
        } else if avg_secs > 0.0 && avg_secs < 1.0 {
            score += ((1.0 - avg_secs) * 10.0).min(10.0);
        }

        if let Some(at) = self.last_failure
            && (Utc::now() - at).num_seconds() < 300
        {
            score -= 15.0;
        }

        score.max(0.0)
    }
}

/// Configuration and telemetry for one lookup endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Human-readable name; also the key used in cache entry metadata
    pub name: String,

    /// Endpoint URL
    pub url: String,

    /// Response interpretation
    #[serde(default)]
    pub format: ResponseFormat,

    /// JSON field carrying the address (JSON format only)
    #[serde(default)]
    pub json_field: Option<String>,

    /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// Disabled sources are skipped entirely
    #[serde(default = "default_source_enabled")]
    pub enabled: bool,

    /// Query priority: 1 is highest; ties broken by performance score
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Rolling health telemetry
    #[serde(default)]
    pub health: SourceHealth,
}

impl SourceConfig {
    /// Create a source with defaults for everything but name and URL
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format: ResponseFormat::Auto,
            json_field: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            enabled: true,
            priority: default_priority(),
            health: SourceHealth::default(),
        }
    }

    /// Set the response format
    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the JSON field to read the address from
    pub fn with_json_field(mut self, field: impl Into<String>) -> Self {
        self.json_field = Some(field.into());
        self
    }

    /// Set the query priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Validate the source definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::config("source name cannot be empty"));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(crate::Error::config(format!(
                "source '{}' URL must use http or https: {}",
                self.name, self.url
            )));
        }
        if self.timeout_secs <= 0.0 {
            return Err(crate::Error::config(format!(
                "source '{}' timeout must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> f64 {
    10.0
}

fn default_source_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    1
}

/// Built-in fallback sources, used when no custom sources are configured
pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("ipify-json", "https://api.ipify.org?format=json")
            .with_format(ResponseFormat::Json)
            .with_json_field("ip")
            .with_priority(1),
        SourceConfig::new("ipify-text", "https://api.ipify.org")
            .with_format(ResponseFormat::PlainText)
            .with_priority(2),
        SourceConfig::new("ifconfig-me", "https://ifconfig.me/ip")
            .with_format(ResponseFormat::PlainText)
            .with_priority(3),
        SourceConfig::new("icanhazip", "https://icanhazip.com/")
            .with_format(ResponseFormat::PlainText)
            .with_priority(4),
        SourceConfig::new("aws-checkip", "https://checkip.amazonaws.com/")
            .with_format(ResponseFormat::PlainText)
            .with_priority(5),
    ]
}

/// Order sources for querying: priority ascending, then performance score
/// descending so healthier sources are tried first within a priority band.
pub fn order_for_query(sources: &mut [SourceConfig]) {
    sources.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then(
            b.health
                .performance_score()
                .partial_cmp(&a.health.performance_score())
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
}

/// Check that a string is a syntactically valid v4 or v6 address.
///
/// Syntax only: no reachability or allocation checks.
pub fn is_valid_ip(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}

/// Extract an address candidate from a raw response body.
///
/// Pure function: JSON parsing per the configured field (or probed common
/// fields), plain-text trimming, or content-type sniffing for AUTO. Returns
/// None for malformed JSON, a missing/non-string field, or an empty body;
/// the caller records that as a per-source validation failure.
pub fn extract_candidate(
    body: &str,
    content_type: Option<&str>,
    config: &SourceConfig,
) -> Option<String> {
    let treat_as_json = match config.format {
        ResponseFormat::Json => true,
        ResponseFormat::PlainText => false,
        ResponseFormat::Auto => content_type
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false),
    };

    if treat_as_json {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let field_value = match &config.json_field {
            Some(field) => value.get(field.as_str()),
            None => COMMON_JSON_FIELDS
                .iter()
                .find_map(|field| value.get(*field)),
        };
        field_value
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Raw result of one fetch against one source
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// HTTP status code
    pub status: u16,
    /// Response content-type header, if present
    pub content_type: Option<String>,
    /// Response body
    pub body: String,
    /// Wall-clock request latency in milliseconds
    pub elapsed_ms: u64,
}

/// Transport seam for the resolution engine.
///
/// Implementations perform the actual request with the source's headers and
/// timeout. Transport-level failures (timeout, connection error, non-2xx
/// status) are reported as errors; the engine records them as per-source
/// failures and never propagates them to its caller.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the source's endpoint once
    async fn fetch(&self, source: &SourceConfig) -> Result<FetchOutcome>;
}
