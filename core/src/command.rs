//! The generic command pipeline: load → check → decide → push → re-fold.
//!
//! Every business write path implements [`WriteCommand`] and is run with
//! [`Eventstore::execute`]:
//!
//! 1. [`WriteCommand::validate`] rejects malformed input with
//!    `InvalidArgument` before any state is loaded.
//! 2. The write model is loaded with
//!    [`Eventstore::filter_to_query_reducer`].
//! 3. [`WriteCommand::check`] fails fast with `NotFound`, `AlreadyExists` or
//!    `PreconditionFailed`; nothing is pushed.
//! 4. [`WriteCommand::decide`] builds the events and constraint diffs. An
//!    empty decision means the command changes nothing and fails with
//!    `PreconditionFailed`.
//! 5. The events are pushed; the pushed events are folded back into the same
//!    write model without a second read, and the model is returned.
//!
//! Commands should be decided against the loaded aggregate sequence
//! (see [`expect_sequence_of`]) so a concurrent write turns into a
//! `ConcurrencyConflict` instead of a lost update.

use crate::error::EventstoreError;
use crate::event::Command;
use crate::eventstore::Eventstore;
use crate::write_model::{ObjectState, QueryReducer, WriteModel};

/// A business write path.
pub trait WriteCommand<E>: Send + Sync {
    /// Write model the command is validated against.
    type Model: QueryReducer<Event = E>;

    /// Validate input before loading anything.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed input.
    fn validate(&self) -> Result<(), EventstoreError> {
        Ok(())
    }

    /// Fresh, empty write model scoped to the command's aggregate.
    fn write_model(&self) -> Self::Model;

    /// Check preconditions against the loaded model.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `AlreadyExists` or `PreconditionFailed`.
    fn check(&self, model: &Self::Model) -> Result<(), EventstoreError>;

    /// Build the commands to push. An empty list means "no change".
    ///
    /// # Errors
    ///
    /// Returns an error if a payload cannot be built.
    fn decide(&self, model: &Self::Model) -> Result<Vec<Command>, EventstoreError>;
}

impl<E: Send + Sync + 'static> Eventstore<E> {
    /// Run a write command through the pipeline and return the updated write model.
    ///
    /// # Errors
    ///
    /// Any error of the taxonomy in [`EventstoreError`]; on error nothing was appended.
    pub async fn execute<C>(&self, command: &C) -> Result<C::Model, EventstoreError>
    where
        C: WriteCommand<E>,
    {
        command.validate()?;

        let mut model = command.write_model();
        self.filter_to_query_reducer(&mut model).await?;

        command.check(&model)?;

        let commands = command.decide(&model)?;
        if commands.is_empty() {
            return Err(EventstoreError::PreconditionFailed(
                "command does not change anything".to_string(),
            ));
        }

        let pushed = self.push(commands).await?;
        model.append_events(self.registry().decode_all(&pushed)?);
        model.reduce()?;
        Ok(model)
    }
}

/// Require all `commands` to be applied on top of the model's processed sequence.
#[must_use]
pub fn expect_sequence_of<E>(model: &WriteModel<E>, commands: Vec<Command>) -> Vec<Command> {
    commands
        .into_iter()
        .map(|command| command.expect_sequence(model.processed_sequence))
        .collect()
}

/// Fail with `NotFound` unless the aggregate exists.
///
/// # Errors
///
/// Returns `NotFound` naming `what`.
pub fn ensure_exists(state: ObjectState, what: &str) -> Result<(), EventstoreError> {
    if state.exists() {
        Ok(())
    } else {
        Err(EventstoreError::NotFound(format!("{what} not found")))
    }
}

/// Fail with `AlreadyExists` if the aggregate was ever created.
///
/// Removed aggregates count as existing: their ids are never reused.
///
/// # Errors
///
/// Returns `AlreadyExists` naming `what`.
pub fn ensure_not_exists(state: ObjectState, what: &str) -> Result<(), EventstoreError> {
    if state == ObjectState::NotExists {
        Ok(())
    } else {
        Err(EventstoreError::AlreadyExists(format!("{what} already exists")))
    }
}

/// Fail with `PreconditionFailed` if `current == requested`.
///
/// # Errors
///
/// Returns `PreconditionFailed` naming `what`.
pub fn ensure_changed<T: PartialEq + ?Sized>(
    current: &T,
    requested: &T,
    what: &str,
) -> Result<(), EventstoreError> {
    if current == requested {
        Err(EventstoreError::PreconditionFailed(format!(
            "{what} is unchanged"
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existence_checks() {
        assert!(ensure_exists(ObjectState::Active, "user").is_ok());
        assert!(matches!(
            ensure_exists(ObjectState::Removed, "user"),
            Err(EventstoreError::NotFound(_))
        ));
        assert!(ensure_not_exists(ObjectState::NotExists, "user").is_ok());
        assert!(matches!(
            ensure_not_exists(ObjectState::Removed, "user"),
            Err(EventstoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn unchanged_value_is_precondition_failure() {
        assert!(matches!(
            ensure_changed("alice", "alice", "username"),
            Err(EventstoreError::PreconditionFailed(_))
        ));
        assert!(ensure_changed("alice", "bob", "username").is_ok());
    }
}
