//! Error types for engine operations
//!
//! Errors are classified by recoverability:
//! - Retryable: lost a concurrent-mutation race, collaborator channel failures
//! - NonRetryable: unknown ids, invalid state transitions, malformed input
//!
//! The retry policy lives in the type so the invoking scheduler never has to
//! guess from a message string whether re-running an operation is safe.

use thiserror::Error;

use crate::db::DbError;

/// Error type for invoice, reminder, and escalation operations.
#[derive(Debug, Error)]
pub enum EngineError {
    // Non-retryable errors
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Reminder not found: {0}")]
    ReminderNotFound(String),

    #[error("Invalid transition: {0}")]
    PreconditionFailed(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    // Retryable errors
    #[error("Concurrent mutation lost race on {0}, retry with fresh state")]
    ConflictRetry(String),

    #[error("{channel} channel failed: {message}")]
    Collaborator { channel: &'static str, message: String },

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl EngineError {
    /// Returns true if the caller should retry the operation.
    ///
    /// `ConflictRetry` wants an immediate retry with fresh state;
    /// `Collaborator` wants backoff and a bounded number of attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConflictRetry(_) | EngineError::Collaborator { .. }
        )
    }

    /// Returns true if the error means the caller sent something the engine
    /// will never accept, regardless of retries.
    pub fn requires_caller_correction(&self) -> bool {
        matches!(
            self,
            EngineError::InvoiceNotFound(_)
                | EngineError::ReminderNotFound(_)
                | EngineError::PreconditionFailed(_)
                | EngineError::Validation(_)
        )
    }

    /// Shorthand for a collaborator channel failure.
    pub fn collaborator(channel: &'static str, message: impl Into<String>) -> Self {
        EngineError::Collaborator {
            channel,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = EngineError::ConflictRetry("inv-1".to_string());
        assert!(err.is_retryable());
        assert!(!err.requires_caller_correction());
    }

    #[test]
    fn test_collaborator_is_retryable() {
        let err = EngineError::collaborator("mail", "timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_precondition_requires_correction() {
        let err = EngineError::PreconditionFailed("confirm on paid invoice".to_string());
        assert!(!err.is_retryable());
        assert!(err.requires_caller_correction());
    }

    #[test]
    fn test_validation_requires_correction() {
        let err = EngineError::Validation("confidence out of range".to_string());
        assert!(err.requires_caller_correction());
    }
}
