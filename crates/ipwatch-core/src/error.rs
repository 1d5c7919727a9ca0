//! Error types for the ipwatch resolution engine
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for resolution operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the resolution engine
#[derive(Error, Debug)]
pub enum Error {
    /// Per-source fetch errors (timeout, connection, non-2xx status)
    #[error("Source error ({source_name}): {message}")]
    Source {
        /// Name of the source that failed
        source_name: String,
        /// Error message
        message: String,
    },

    /// A response was received but no syntactically valid address was found
    #[error("Validation error ({source_name}): {message}")]
    Validation {
        /// Name of the source that produced the response
        source_name: String,
        /// Error message
        message: String,
    },

    /// No source produced a valid address after all retry attempts
    #[error("All sources exhausted after {attempts} attempt(s)")]
    Exhausted {
        /// Number of attempts performed
        attempts: usize,
    },

    /// Cache-related errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (cache persistence, source definition files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a per-source fetch error
    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
