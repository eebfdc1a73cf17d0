// src/error.rs
// Standardized error types for the memory service

use thiserror::Error;

/// Main error type for the claude-memory library.
///
/// Variants map to the pipeline error taxonomy: boundaries convert
/// low-level failures into one of these kinds, and surfaces (MCP/HTTP)
/// translate kinds into status codes and error envelopes.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("permission denied: {0}")]
    Security(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MemoryError
pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    /// Whether a retry with backoff is worthwhile for this error kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            MemoryError::ResourceExhausted(_)
            | MemoryError::ExternalService(_)
            | MemoryError::Timeout(_) => true,
            MemoryError::Db(e) => is_sqlite_contention(e),
            MemoryError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Short machine-readable code for HTTP error envelopes.
    pub fn error_code(&self) -> &'static str {
        match self {
            MemoryError::Validation(_) => "VALIDATION",
            MemoryError::NotFound(_) => "NOT_FOUND",
            MemoryError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            MemoryError::ExternalService(_) => "EXTERNAL_SERVICE",
            MemoryError::Timeout(_) => "TIMEOUT",
            MemoryError::Db(_) => "DATABASE",
            MemoryError::Security(_) => "PERMISSION_DENIED",
            MemoryError::Processing(_) => "PROCESSING",
            MemoryError::Config(_) => "CONFIG",
            MemoryError::Cancelled => "CANCELLED",
            _ => "INTERNAL",
        }
    }

    /// Convert to user-facing string for MCP tool boundaries
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY occurs with file-based databases under write contention;
/// SQLITE_LOCKED occurs with shared-cache in-memory databases when another
/// connection holds a write lock on the same table.
pub(crate) fn is_sqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

impl From<String> for MemoryError {
    fn from(s: String) -> Self {
        MemoryError::Other(s)
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MemoryError::Cancelled
        } else {
            MemoryError::Other(err.to_string())
        }
    }
}

impl From<MemoryError> for String {
    fn from(err: MemoryError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MemoryError::Timeout("slow".into()).is_retryable());
        assert!(MemoryError::ResourceExhausted("rate limit".into()).is_retryable());
        assert!(MemoryError::ExternalService("503".into()).is_retryable());
        assert!(!MemoryError::Validation("bad".into()).is_retryable());
        assert!(!MemoryError::NotFound("gone".into()).is_retryable());
        assert!(!MemoryError::Security("denied".into()).is_retryable());
    }

    #[test]
    fn test_db_contention_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        assert!(MemoryError::Db(busy).is_retryable());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        assert!(!MemoryError::Db(constraint).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MemoryError::Validation("x".into()).error_code(), "VALIDATION");
        assert_eq!(MemoryError::NotFound("x".into()).error_code(), "NOT_FOUND");
        assert_eq!(MemoryError::Cancelled.error_code(), "CANCELLED");
    }
}
