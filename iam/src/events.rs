//! User aggregate events.
//!
//! Payloads are plain serde structs; [`IamEvent`] is the decoded enum every
//! reducer matches on exhaustively. [`registry`] maps each
//! `(aggregate type, event type, version)` to its payload type.

use serde::{Deserialize, Serialize};
use warden_core::{Event, EventRegistry};

/// Aggregate type of users.
pub const USER_AGGREGATE: &str = "user";

/// Current schema version of the user aggregate.
pub const USER_VERSION: &str = "v1";

/// Unique-constraint namespace for usernames.
pub const USERNAMES: &str = "usernames";

/// A user was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAdded {
    /// Login name; unique within the instance.
    pub username: String,
    /// Name shown in UIs.
    pub display_name: String,
}

impl Event for UserAdded {
    fn event_type(&self) -> &'static str {
        "user.added"
    }
}

/// A user's login name changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameChanged {
    /// Name released by the change.
    pub old_username: String,
    /// New login name.
    pub username: String,
}

impl Event for UsernameChanged {
    fn event_type(&self) -> &'static str {
        "user.username.changed"
    }
}

/// A user was locked out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeactivated;

impl Event for UserDeactivated {
    fn event_type(&self) -> &'static str {
        "user.deactivated"
    }
}

/// A deactivated user was let back in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReactivated;

impl Event for UserReactivated {
    fn event_type(&self) -> &'static str {
        "user.reactivated"
    }
}

/// A user was removed for good.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRemoved {
    /// Name released by the removal.
    pub username: String,
}

impl Event for UserRemoved {
    fn event_type(&self) -> &'static str {
        "user.removed"
    }
}

/// Decoded user events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IamEvent {
    /// See [`UserAdded`].
    UserAdded(UserAdded),
    /// See [`UsernameChanged`].
    UsernameChanged(UsernameChanged),
    /// See [`UserDeactivated`].
    UserDeactivated(UserDeactivated),
    /// See [`UserReactivated`].
    UserReactivated(UserReactivated),
    /// See [`UserRemoved`].
    UserRemoved(UserRemoved),
}

/// Registry decoding every user event of schema [`USER_VERSION`].
#[must_use]
pub fn registry() -> EventRegistry<IamEvent> {
    EventRegistry::new()
        .register(USER_AGGREGATE, "user.added", USER_VERSION, IamEvent::UserAdded)
        .register(
            USER_AGGREGATE,
            "user.username.changed",
            USER_VERSION,
            IamEvent::UsernameChanged,
        )
        .register(
            USER_AGGREGATE,
            "user.deactivated",
            USER_VERSION,
            IamEvent::UserDeactivated,
        )
        .register(
            USER_AGGREGATE,
            "user.reactivated",
            USER_VERSION,
            IamEvent::UserReactivated,
        )
        .register(USER_AGGREGATE, "user.removed", USER_VERSION, IamEvent::UserRemoved)
}

/// Normalised value stored in the [`USERNAMES`] constraint.
#[must_use]
pub fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{AggregateType, EventType};

    #[test]
    fn registry_covers_every_event() {
        let registry = registry();
        assert_eq!(
            registry.event_types(&AggregateType::new(USER_AGGREGATE)),
            vec![
                EventType::new("user.added"),
                EventType::new("user.deactivated"),
                EventType::new("user.reactivated"),
                EventType::new("user.removed"),
                EventType::new("user.username.changed"),
            ]
        );
    }

    #[test]
    fn usernames_compare_case_insensitively() {
        assert_eq!(username_key(" Alice "), username_key("alice"));
    }
}
