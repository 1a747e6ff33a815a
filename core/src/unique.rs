//! Unique constraints.
//!
//! The log is partitioned per aggregate, so cross-aggregate invariants such as
//! "usernames are unique within an instance" cannot be checked by folding a
//! single aggregate. Instead a command declares constraint changes that the
//! backend applies in the same transaction as the append: an `Add` that
//! collides with an existing `(instance, type, field)` fails the whole push.

use serde::{Deserialize, Serialize};

/// Whether a constraint is claimed or released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueConstraintAction {
    /// Claim the value; fails if already claimed.
    Add,
    /// Release the value.
    Remove,
}

/// A unique-constraint change declared by a command.
///
/// The instance is taken from the command's aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint namespace, e.g. `usernames`.
    pub unique_type: String,
    /// The value that must be unique.
    pub field: String,
    /// Claim or release.
    pub action: UniqueConstraintAction,
    /// Message reported on collision.
    pub error_message: String,
}

impl UniqueConstraint {
    /// Claim `field` within `unique_type`.
    #[must_use]
    pub fn add(
        unique_type: impl Into<String>,
        field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            field: field.into(),
            action: UniqueConstraintAction::Add,
            error_message: error_message.into(),
        }
    }

    /// Release `field` within `unique_type`.
    #[must_use]
    pub fn remove(unique_type: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            field: field.into(),
            action: UniqueConstraintAction::Remove,
            error_message: String::new(),
        }
    }
}
