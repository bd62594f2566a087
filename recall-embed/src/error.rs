//! Embedding client error types.

use recall_core::RecallError;
use thiserror::Error;

/// Errors from an embedding backend.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// HTTP request failed.
    #[error("embedding request failed: {0}")]
    RequestFailed(String),

    /// The service answered with something we cannot decode.
    #[error("failed to parse embedding response: {0}")]
    ParseError(String),

    /// Request timed out.
    #[error("embedding request timed out after {0}ms")]
    Timeout(u64),

    /// The provider cannot be reached or is not configured.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("all embedding attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Configuration error.
    #[error("embedding configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EmbedError::Timeout(0)
        } else if err.is_connect() {
            EmbedError::Unavailable(err.to_string())
        } else {
            EmbedError::RequestFailed(err.to_string())
        }
    }
}

impl From<EmbedError> for RecallError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::ConfigError(msg) => RecallError::Config(msg),
            other => RecallError::Dependency(other.to_string()),
        }
    }
}
