//! Error types for the recall core library.

use std::fmt;

use thiserror::Error;

use crate::model::MemoryKind;

/// Top-level error type for all recall operations.
#[derive(Error, Debug)]
pub enum RecallError {
    /// A memory with the given id was not found where one was required.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Which memory type was looked up.
        kind: MemoryKind,
        /// The missing id.
        id: String,
    },

    /// Caller input was rejected before touching the store.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store or the embedding service failed or is unavailable.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// An embedding had the wrong number of components.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured model dimension.
        expected: usize,
        /// Dimension actually produced.
        actual: usize,
    },

    /// A concurrent writer created the same id first.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller-supplied deadline passed before the operation finished.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing classification of a [`RecallError`].
///
/// Callers branch on this rather than on individual variants: retry,
/// abort, or treat as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing object.
    NotFound,
    /// Bad input; retrying with the same input will fail again.
    Validation,
    /// Store or embedder failure.
    Dependency,
    /// Concurrent create of the same id.
    Conflict,
    /// Cancelled or timed out by the caller.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Dependency => "dependency",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl RecallError {
    /// Shorthand for building a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for building a not-found error.
    pub fn not_found(kind: MemoryKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Collapse this error into the caller-facing taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::Database(e) if is_key_conflict(e) => ErrorKind::Conflict,
            Self::Dependency(_)
            | Self::DimensionMismatch { .. }
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Dependency,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DimensionMismatch { .. } => false,
            Self::DeadlineExceeded => true,
            _ => matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Dependency),
        }
    }
}

fn is_key_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        ),
        _ => false,
    }
}

impl From<serde_json::Error> for RecallError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RecallError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Dependency(format!("store task failed: {err}"))
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, RecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_mapping() {
        assert_eq!(
            RecallError::not_found(MemoryKind::Entity, "x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(RecallError::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(
            RecallError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
            .kind(),
            ErrorKind::Dependency
        );
        assert_eq!(RecallError::DeadlineExceeded.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn retryability() {
        assert!(RecallError::Conflict("dup".into()).is_retryable());
        assert!(RecallError::Dependency("down".into()).is_retryable());
        assert!(!RecallError::validation("bad").is_retryable());
        assert!(
            !RecallError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn unique_violation_is_conflict() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .expect("setup");
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .expect_err("duplicate insert must fail");
        assert_eq!(RecallError::from(err).kind(), ErrorKind::Conflict);
    }
}
