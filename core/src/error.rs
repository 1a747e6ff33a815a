//! Error taxonomy shared by the event log and the command pipeline.
//!
//! Every synchronous write path surfaces exactly one of these variants:
//!
//! - [`EventstoreError::InvalidArgument`]: caller error, never retried
//! - [`EventstoreError::NotFound`], [`EventstoreError::AlreadyExists`],
//!   [`EventstoreError::PreconditionFailed`]: business-state errors, nothing was pushed
//! - [`EventstoreError::ConcurrencyConflict`], [`EventstoreError::UniqueConstraintViolation`]:
//!   push-time errors, the caller may retry with fresh state
//! - [`EventstoreError::Internal`]: storage or transport failure

use crate::aggregate::{AggregateId, AggregateType, InstanceId};
use thiserror::Error;

/// Errors returned by the event log and the command pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventstoreError {
    /// Malformed input, rejected before any state is loaded.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The aggregate a command targets does not exist (or was removed).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The aggregate a command wants to create already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The command would not change anything, or the aggregate is in the wrong state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The aggregate moved on since the write model was loaded.
    #[error(
        "Concurrency conflict on {aggregate_type}/{aggregate_id} in instance {instance_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Instance of the conflicting aggregate.
        instance_id: InstanceId,
        /// Type of the conflicting aggregate.
        aggregate_type: AggregateType,
        /// Id of the conflicting aggregate.
        aggregate_id: AggregateId,
        /// The aggregate sequence the command was decided against.
        expected: u64,
        /// The aggregate sequence found in the log.
        actual: u64,
    },

    /// A unique constraint declared by a command collided with an existing one.
    #[error("Unique constraint violated ({unique_type}: {field}): {message}")]
    UniqueConstraintViolation {
        /// Constraint namespace (e.g. `usernames`).
        unique_type: String,
        /// The colliding value.
        field: String,
        /// Error message declared by the command.
        message: String,
    },

    /// Storage or transport failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventstoreError {
    /// Whether the caller may retry the whole command with freshly loaded state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::UniqueConstraintViolation { .. }
        )
    }

    /// Whether the error was raised before anything was pushed because of
    /// the current aggregate state.
    #[must_use]
    pub const fn is_business_state(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::PreconditionFailed(_)
        )
    }
}

impl From<crate::event::EventError> for EventstoreError {
    fn from(err: crate::event::EventError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_display() {
        let error = EventstoreError::ConcurrencyConflict {
            instance_id: InstanceId::new("inst-1"),
            aggregate_type: AggregateType::new("user"),
            aggregate_id: AggregateId::new("u-1"),
            expected: 3,
            actual: 4,
        };

        let display = format!("{error}");
        assert!(display.contains("user/u-1"));
        assert!(display.contains("expected sequence 3"));
        assert!(display.contains("found 4"));
        assert!(error.is_retryable());
    }

    #[test]
    fn business_state_errors_are_not_retryable() {
        let error = EventstoreError::PreconditionFailed("no change".to_string());
        assert!(error.is_business_state());
        assert!(!error.is_retryable());
        assert!(!EventstoreError::Internal("db".to_string()).is_business_state());
    }
}
