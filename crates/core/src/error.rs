//! Error types for the Themis database core.
//!
//! `ThemisError` is the unified error type for every Themis API. Each
//! variant corresponds to one externally observable error kind, carries
//! the offending key/index/cursor where one exists, and renders to a
//! human-readable message via `thiserror`.
//!
//! Errors originating in the storage or index layer propagate upward
//! unchanged; the query engine never swallows an error from a scan.
//! Non-fatal operational events (empty page, zero results) are never
//! represented as errors.

use std::io;
use thiserror::Error;

/// Result type alias for Themis operations.
pub type Result<T> = std::result::Result<T, ThemisError>;

/// Unified error type for all Themis operations.
///
/// ## Classification
///
/// - `NotFound` is returned to the caller and not logged as an error.
/// - `Conflict` and `LockTimeout` abort the transaction; the caller may
///   retry (`is_retryable`).
/// - `Cancelled` aborts the transaction when a deadline elapses.
/// - `InvalidQuery` is rejected before execution and carries a position.
/// - `InvalidCursor` is a classification aid: the paging layer maps it
///   to an empty page, never to a failed request.
/// - `StorageUnavailable` is fatal to the transaction but leaves the
///   core available for other transactions.
/// - `Internal` flags an invariant violation and is always logged.
#[derive(Debug, Error)]
pub enum ThemisError {
    /// Entity or index absent.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity (pk or index name).
        what: String,
    },

    /// Write-write lock contention: another live transaction holds the key.
    #[error("write conflict on {key}")]
    Conflict {
        /// The contended key.
        key: String,
    },

    /// Lock acquisition exceeded the configured timeout.
    #[error("lock timeout on {key} after {waited_ms}ms")]
    LockTimeout {
        /// The contended key.
        key: String,
        /// How long the acquirer waited.
        waited_ms: u64,
    },

    /// Deadline elapsed or the caller cancelled.
    #[error("cancelled: {operation}")]
    Cancelled {
        /// The operation that observed the expired deadline.
        operation: String,
    },

    /// Vector insert or search with the wrong dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the index was created with.
        expected: usize,
        /// Dimension the caller provided.
        got: usize,
    },

    /// Unique-index collision, required field missing, or a value that
    /// cannot be encoded for the target index kind.
    #[error("schema violation: {message}")]
    SchemaViolation {
        /// What was violated.
        message: String,
    },

    /// Parse error, unknown identifier, unresolved variable, or an
    /// incompatible clause shape. Rejected before execution.
    #[error("invalid query at {line}:{column}: {message}")]
    InvalidQuery {
        /// What is wrong with the query.
        message: String,
        /// 1-based source line.
        line: u32,
        /// 1-based source column.
        column: u32,
    },

    /// Cursor token malformed, version-mismatched, or for another
    /// collection. The paging layer converts this into an empty page.
    #[error("invalid cursor: {reason}")]
    InvalidCursor {
        /// Why the token was rejected.
        reason: String,
    },

    /// Underlying KV error not caused by the caller.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invariant violation. Must not occur; logged with context.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ThemisError {
    /// Create a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        ThemisError::NotFound { what: what.into() }
    }

    /// Create a `Conflict` error for a contended key.
    pub fn conflict(key: impl Into<String>) -> Self {
        ThemisError::Conflict { key: key.into() }
    }

    /// Create a `LockTimeout` error.
    pub fn lock_timeout(key: impl Into<String>, waited_ms: u64) -> Self {
        ThemisError::LockTimeout {
            key: key.into(),
            waited_ms,
        }
    }

    /// Create a `Cancelled` error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        ThemisError::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a `DimensionMismatch` error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        ThemisError::DimensionMismatch { expected, got }
    }

    /// Create a `SchemaViolation` error.
    pub fn schema_violation(message: impl Into<String>) -> Self {
        ThemisError::SchemaViolation {
            message: message.into(),
        }
    }

    /// Create an `InvalidQuery` error with a source position.
    pub fn invalid_query(message: impl Into<String>, line: u32, column: u32) -> Self {
        ThemisError::InvalidQuery {
            message: message.into(),
            line,
            column,
        }
    }

    /// Create an `InvalidCursor` error.
    pub fn invalid_cursor(reason: impl Into<String>) -> Self {
        ThemisError::InvalidCursor {
            reason: reason.into(),
        }
    }

    /// Create a `StorageUnavailable` error.
    pub fn storage(message: impl Into<String>) -> Self {
        ThemisError::StorageUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a `StorageUnavailable` error wrapping an underlying error.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ThemisError::StorageUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        ThemisError::Internal {
            message: message.into(),
        }
    }

    /// True for errors where retrying the transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ThemisError::Conflict { .. } | ThemisError::LockTimeout { .. }
        )
    }

    /// True when the referenced entity or index is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ThemisError::NotFound { .. })
    }

    /// True for bad input the caller must fix before retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ThemisError::DimensionMismatch { .. }
                | ThemisError::SchemaViolation { .. }
                | ThemisError::InvalidQuery { .. }
        )
    }

    /// True for errors that indicate corruption or a bug and should be
    /// logged with full context.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            ThemisError::StorageUnavailable { .. } | ThemisError::Internal { .. }
        )
    }
}

impl From<io::Error> for ThemisError {
    fn from(e: io::Error) -> Self {
        ThemisError::StorageUnavailable {
            message: format!("I/O error: {}", e),
            source: Some(Box::new(e)),
        }
    }
}

impl From<bincode::Error> for ThemisError {
    fn from(e: bincode::Error) -> Self {
        ThemisError::StorageUnavailable {
            message: format!("serialization error: {}", e),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for ThemisError {
    fn from(e: serde_json::Error) -> Self {
        ThemisError::StorageUnavailable {
            message: format!("JSON error: {}", e),
            source: Some(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ThemisError::conflict("users:42").is_retryable());
        assert!(ThemisError::lock_timeout("users:42", 1000).is_retryable());
        assert!(!ThemisError::not_found("users:42").is_retryable());
        assert!(!ThemisError::cancelled("scan").is_retryable());
        assert!(!ThemisError::internal("bug").is_retryable());
    }

    #[test]
    fn test_validation_classification() {
        assert!(ThemisError::dimension_mismatch(4, 8).is_validation());
        assert!(ThemisError::schema_violation("unique collision").is_validation());
        assert!(ThemisError::invalid_query("unexpected token", 1, 5).is_validation());
        assert!(!ThemisError::conflict("k").is_validation());
    }

    #[test]
    fn test_serious_classification() {
        assert!(ThemisError::storage("wal corrupt").is_serious());
        assert!(ThemisError::internal("invariant broken").is_serious());
        assert!(!ThemisError::invalid_cursor("bad base64").is_serious());
    }

    #[test]
    fn test_display_carries_context() {
        let msg = ThemisError::conflict("users:42").to_string();
        assert!(msg.contains("users:42"));

        let msg = ThemisError::lock_timeout("users:42", 1000).to_string();
        assert!(msg.contains("1000ms"));

        let msg = ThemisError::invalid_query("unexpected token", 3, 17).to_string();
        assert!(msg.contains("3:17"));

        let msg = ThemisError::dimension_mismatch(384, 768).to_string();
        assert!(msg.contains("384"));
        assert!(msg.contains("768"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let e: ThemisError = io_err.into();
        assert!(matches!(e, ThemisError::StorageUnavailable { .. }));
        assert!(e.is_serious());
    }

    #[test]
    fn test_from_bincode_error() {
        let bad = vec![0xFF_u8; 3];
        let result: std::result::Result<String, bincode::Error> = bincode::deserialize(&bad);
        let e: ThemisError = result.unwrap_err().into();
        assert!(matches!(e, ThemisError::StorageUnavailable { .. }));
    }
}
