//! Ledger error model.

use thiserror::Error;

/// Result type used across the engine.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Engine-level error.
///
/// Deterministic caller-attributable failures (validation, admission,
/// conflicts) are separate variants so callers can branch on them;
/// backend faults collapse into `Internal`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A command failed validation (e.g. non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A reservation (or issue) asked for more than is available.
    ///
    /// Carries both figures so callers can render or react to the gap
    /// without parsing the message.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested row was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Per-key serialization could not be obtained within the retry
    /// budget, or a concurrent writer won. Safe to retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage or runtime fault. Not attributable to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn insufficient_stock(requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            requested,
            available,
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same operation verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_message_carries_both_figures() {
        let err = LedgerError::insufficient_stock(5, 3);
        assert_eq!(err.to_string(), "insufficient stock: requested 5, available 3");
        match err {
            LedgerError::InsufficientStock {
                requested,
                available,
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 3);
            }
            _ => panic!("Expected InsufficientStock"),
        }
    }

    #[test]
    fn only_conflict_is_retryable() {
        assert!(LedgerError::conflict("lock budget exhausted").is_retryable());
        assert!(!LedgerError::validation("bad qty").is_retryable());
        assert!(!LedgerError::insufficient_stock(1, 0).is_retryable());
        assert!(!LedgerError::not_found("balance").is_retryable());
        assert!(!LedgerError::internal("db down").is_retryable());
    }
}
