//! Test doubles and common utilities for resolution contract tests
//!
//! `ScriptedFetcher` is a network-free `SourceFetcher`: each source name is
//! given a queue of canned outcomes, and every call is counted so tests can
//! assert exactly which sources were contacted and how often. When a queue
//! runs dry its last outcome repeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ipwatch_core::{Error, FetchOutcome, Result, SourceConfig, SourceFetcher};

/// Canned latency reported by every scripted fetch
const SCRIPTED_ELAPSED_MS: u64 = 50;

/// One canned outcome for a scripted source
#[derive(Debug, Clone)]
pub enum Scripted {
    /// 200 response with the given body and content type
    Ok {
        body: String,
        content_type: Option<String>,
    },
    /// Response with an explicit status code
    Status { status: u16, body: String },
    /// Transport-level failure
    Fail(String),
}

#[derive(Default)]
struct ScriptedState {
    scripts: HashMap<String, VecDeque<Scripted>>,
    calls: HashMap<String, usize>,
}

/// Network-free fetcher driven by per-source scripts
#[derive(Default)]
pub struct ScriptedFetcher {
    state: Mutex<ScriptedState>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text 200 response for a source
    pub fn ok(self, name: &str, body: &str) -> Self {
        self.push(
            name,
            Scripted::Ok {
                body: body.to_string(),
                content_type: Some("text/plain".to_string()),
            },
        );
        self
    }

    /// Queue a JSON 200 response for a source
    pub fn ok_json(self, name: &str, body: &str) -> Self {
        self.push(
            name,
            Scripted::Ok {
                body: body.to_string(),
                content_type: Some("application/json".to_string()),
            },
        );
        self
    }

    /// Queue a non-2xx response for a source
    pub fn status(self, name: &str, status: u16) -> Self {
        self.push(
            name,
            Scripted::Status {
                status,
                body: String::new(),
            },
        );
        self
    }

    /// Queue a transport failure for a source
    pub fn fail(self, name: &str, message: &str) -> Self {
        self.push(name, Scripted::Fail(message.to_string()));
        self
    }

    fn push(&self, name: &str, outcome: Scripted) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(name.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// How many times a source was fetched
    pub fn calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Total fetches across all sources
    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }
}

#[async_trait::async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<FetchOutcome> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(source.name.clone()).or_insert(0) += 1;

            let queue = state
                .scripts
                .get_mut(&source.name)
                .ok_or_else(|| Error::source(&source.name, "no script for source"))?;
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue
                    .front()
                    .cloned()
                    .ok_or_else(|| Error::source(&source.name, "script queue empty"))?
            }
        };

        match outcome {
            Scripted::Ok { body, content_type } => Ok(FetchOutcome {
                status: 200,
                content_type,
                body,
                elapsed_ms: SCRIPTED_ELAPSED_MS,
            }),
            Scripted::Status { status, body } => Ok(FetchOutcome {
                status,
                content_type: None,
                body,
                elapsed_ms: SCRIPTED_ELAPSED_MS,
            }),
            Scripted::Fail(message) => Err(Error::source(&source.name, message)),
        }
    }
}

/// A plain-text source named `name` pointing at a fake URL
pub fn text_source(name: &str) -> SourceConfig {
    SourceConfig::new(name, format!("https://{}.test/ip", name))
        .with_format(ipwatch_core::ResponseFormat::PlainText)
}

/// A resolver configuration with sane test defaults: one attempt,
/// sequential, memory-only cache, breaker off.
pub fn test_config(sources: Vec<SourceConfig>) -> ipwatch_core::ResolverConfig {
    let mut config = ipwatch_core::ResolverConfig::new();
    config.max_retries = 1;
    config.retry_delay_secs = 1;
    config.use_concurrent = false;
    config.breaker.enabled = false;
    config.sources = sources;
    config
}
