//! Events: commands waiting to be appended, events read back from the log,
//! and decoded envelopes handed to reducers.
//!
//! # Design
//!
//! Event payloads are serialized with `bincode`. A payload type implements
//! [`Event`], which names its event type; the log never interprets payload
//! bytes. Decoding back into a typed enum goes through an explicit
//! [`EventRegistry`](crate::registry::EventRegistry).
//!
//! # Example
//!
//! ```
//! use warden_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct UserAdded {
//!     username: String,
//! }
//!
//! impl Event for UserAdded {
//!     fn event_type(&self) -> &'static str {
//!         "user.added"
//!     }
//! }
//! ```

use crate::aggregate::{Aggregate, EventType};
use crate::unique::UniqueConstraint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event payload operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize a payload to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize a payload from bytes.
    #[error("Failed to deserialize event {event_type}: {reason}")]
    DeserializationError {
        /// Event type whose payload failed to decode.
        event_type: String,
        /// Decoder message.
        reason: String,
    },
}

/// A payload that can be appended to the log.
///
/// The event type should be stable across releases; schema changes bump the
/// aggregate [`Version`](crate::aggregate::Version) instead.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this payload.
    fn event_type(&self) -> &'static str;

    /// Serialize this payload to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }
}

/// Who caused an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Editor {
    /// Calling service, e.g. `management-api`.
    pub service: String,
    /// Acting user id.
    pub user: String,
}

impl Editor {
    /// Create a new editor identity.
    #[must_use]
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

/// An event waiting to be pushed, together with the unique-constraint changes
/// it declares and the aggregate sequence it was decided against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Aggregate the event belongs to.
    pub aggregate: Aggregate,
    /// Event type.
    pub event_type: EventType,
    /// Bincode payload.
    pub payload: Vec<u8>,
    /// Who caused the event.
    pub editor: Editor,
    /// Unique-constraint changes applied atomically with the append.
    pub unique_constraints: Vec<UniqueConstraint>,
    /// Aggregate sequence the aggregate must still be at, if checked.
    pub expected_sequence: Option<u64>,
}

impl Command {
    /// Build a command from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be serialized.
    pub fn new<P: Event + Serialize>(
        aggregate: Aggregate,
        editor: Editor,
        payload: &P,
    ) -> Result<Self, EventError> {
        Ok(Self {
            aggregate,
            event_type: EventType::new(payload.event_type()),
            payload: payload.to_bytes()?,
            editor,
            unique_constraints: Vec::new(),
            expected_sequence: None,
        })
    }

    /// Declare a unique-constraint change.
    #[must_use]
    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    /// Require the aggregate to still be at `sequence` (0 for a new aggregate).
    #[must_use]
    pub const fn expect_sequence(mut self, sequence: u64) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }
}

/// An immutable event as persisted in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    /// Aggregate the event belongs to.
    pub aggregate: Aggregate,
    /// Event type.
    pub event_type: EventType,
    /// Position in the instance's log; strictly increasing per instance.
    pub sequence: u64,
    /// Position within the aggregate; gapless, starting at 1.
    pub aggregate_sequence: u64,
    /// Bincode payload.
    pub payload: Vec<u8>,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Who caused the event.
    pub editor: Editor,
}

impl StoredEvent {
    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes do not match `P`.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, EventError> {
        bincode::deserialize(&self.payload).map_err(|e| EventError::DeserializationError {
            event_type: self.event_type.to_string(),
            reason: e.to_string(),
        })
    }

    /// Wrap an already decoded payload together with this event's metadata.
    #[must_use]
    pub fn envelope<E>(&self, event: E) -> Envelope<E> {
        Envelope {
            aggregate: self.aggregate.clone(),
            event_type: self.event_type.clone(),
            sequence: self.sequence,
            aggregate_sequence: self.aggregate_sequence,
            created_at: self.created_at,
            editor: self.editor.clone(),
            event,
        }
    }
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredEvent {{ {} #{} ({}), type: {}, size: {} bytes }}",
            self.aggregate,
            self.aggregate_sequence,
            self.sequence,
            self.event_type,
            self.payload.len()
        )
    }
}

/// A decoded event together with its log metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<E> {
    /// Aggregate the event belongs to.
    pub aggregate: Aggregate,
    /// Event type.
    pub event_type: EventType,
    /// Position in the instance's log.
    pub sequence: u64,
    /// Position within the aggregate.
    pub aggregate_sequence: u64,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Who caused the event.
    pub editor: Editor,
    /// Decoded payload.
    pub event: E,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::unique::UniqueConstraint;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Renamed {
        name: String,
    }

    impl Event for Renamed {
        fn event_type(&self) -> &'static str {
            "thing.renamed"
        }
    }

    fn aggregate() -> Aggregate {
        Aggregate::new("thing", "t-1", "inst-1", "org-1", "v1")
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn command_carries_type_and_constraints() {
        let command = Command::new(
            aggregate(),
            Editor::new("svc", "admin"),
            &Renamed {
                name: "new".to_string(),
            },
        )
        .expect("serialization should succeed")
        .with_unique_constraint(UniqueConstraint::add("names", "new", "name taken"))
        .expect_sequence(2);

        assert_eq!(command.event_type.as_str(), "thing.renamed");
        assert_eq!(command.unique_constraints.len(), 1);
        assert_eq!(command.expected_sequence, Some(2));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if decoding fails
    fn stored_event_decodes_payload() {
        let payload = Renamed {
            name: "bob".to_string(),
        };
        let stored = StoredEvent {
            aggregate: aggregate(),
            event_type: EventType::new("thing.renamed"),
            sequence: 10,
            aggregate_sequence: 2,
            payload: payload.to_bytes().expect("serialization should succeed"),
            created_at: Utc::now(),
            editor: Editor::default(),
        };

        let decoded: Renamed = stored.decode().expect("decoding should succeed");
        assert_eq!(decoded, payload);

        let envelope = stored.envelope(decoded);
        assert_eq!(envelope.sequence, 10);
        assert_eq!(envelope.aggregate_sequence, 2);
    }

    #[test]
    fn corrupt_payload_reports_event_type() {
        let stored = StoredEvent {
            aggregate: aggregate(),
            event_type: EventType::new("thing.renamed"),
            sequence: 1,
            aggregate_sequence: 1,
            payload: vec![255],
            created_at: Utc::now(),
            editor: Editor::default(),
        };

        let result: Result<Renamed, _> = stored.decode();
        let Err(err) = result else {
            unreachable!("a single byte cannot decode into a string payload");
        };
        assert!(err.to_string().contains("thing.renamed"));
    }
}
