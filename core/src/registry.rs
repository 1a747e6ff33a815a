//! Versioned event schema registry.
//!
//! Maps `(aggregate type, event type, version)` to a typed decode function
//! producing one variant of an application-wide event enum. The registry is
//! built once at startup and owned by the [`Eventstore`](crate::eventstore::Eventstore);
//! there is no global registration.
//!
//! # Example
//!
//! ```
//! use warden_core::registry::EventRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct UserAdded { username: String }
//!
//! #[derive(Clone, Debug)]
//! enum IamEvent { UserAdded(UserAdded) }
//!
//! let registry = EventRegistry::new()
//!     .register("user", "user.added", "v1", IamEvent::UserAdded);
//! assert!(registry.is_registered("user", "user.added", "v1"));
//! ```

use crate::aggregate::{AggregateType, EventType, Version};
use crate::event::{Envelope, EventError, StoredEvent};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

type DecodeFn<E> = Box<dyn Fn(&StoredEvent) -> Result<E, EventError> + Send + Sync>;

type SchemaKey = (AggregateType, EventType, Version);

/// Decoders for every event the application understands.
pub struct EventRegistry<E> {
    decoders: HashMap<SchemaKey, DecodeFn<E>>,
}

impl<E: 'static> EventRegistry<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the payload type `P` for a schema key; decoded payloads are
    /// wrapped into the application enum with `into`.
    #[must_use]
    pub fn register<P>(
        mut self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        version: impl Into<Version>,
        into: fn(P) -> E,
    ) -> Self
    where
        P: DeserializeOwned + 'static,
    {
        let decoder: DecodeFn<E> = Box::new(move |stored| stored.decode::<P>().map(into));
        self.decoders.insert(
            (aggregate_type.into(), event_type.into(), version.into()),
            decoder,
        );
        self
    }

    /// Decode a stored event.
    ///
    /// Returns `Ok(None)` for events whose schema is not registered; readers
    /// ignore those.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if a registered payload fails to decode.
    pub fn decode(&self, stored: &StoredEvent) -> Result<Option<Envelope<E>>, EventError> {
        let key = (
            stored.aggregate.aggregate_type.clone(),
            stored.event_type.clone(),
            stored.aggregate.version.clone(),
        );
        let Some(decoder) = self.decoders.get(&key) else {
            return Ok(None);
        };
        decoder(stored).map(|event| Some(stored.envelope(event)))
    }

    /// Decode a batch of stored events, dropping unregistered ones.
    ///
    /// # Errors
    ///
    /// Returns the first decode error encountered.
    pub fn decode_all(&self, stored: &[StoredEvent]) -> Result<Vec<Envelope<E>>, EventError> {
        let mut envelopes = Vec::with_capacity(stored.len());
        for event in stored {
            if let Some(envelope) = self.decode(event)? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }

    /// Whether a schema key has a decoder.
    #[must_use]
    pub fn is_registered(
        &self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        version: impl Into<Version>,
    ) -> bool {
        self.decoders
            .contains_key(&(aggregate_type.into(), event_type.into(), version.into()))
    }

    /// Registered event types of one aggregate type, sorted.
    #[must_use]
    pub fn event_types(&self, aggregate_type: &AggregateType) -> Vec<EventType> {
        let mut types: Vec<EventType> = self
            .decoders
            .keys()
            .filter(|(agg, _, _)| agg == aggregate_type)
            .map(|(_, event_type, _)| event_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Number of registered schema keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl<E: 'static> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("schemas", &self.decoders.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::event::{Editor, Event};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Added {
        name: String,
    }

    impl Event for Added {
        fn event_type(&self) -> &'static str {
            "thing.added"
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum ThingEvent {
        Added(Added),
    }

    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn stored(event_type: &str, version: &str) -> StoredEvent {
        StoredEvent {
            aggregate: Aggregate::new("thing", "t-1", "inst", "org", version),
            event_type: EventType::new(event_type),
            sequence: 7,
            aggregate_sequence: 1,
            payload: Added {
                name: "a".to_string(),
            }
            .to_bytes()
            .expect("serialization should succeed"),
            created_at: Utc::now(),
            editor: Editor::default(),
        }
    }

    fn registry() -> EventRegistry<ThingEvent> {
        EventRegistry::new().register("thing", "thing.added", "v1", ThingEvent::Added)
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if decoding fails
    fn decodes_registered_schema() {
        let envelope = registry()
            .decode(&stored("thing.added", "v1"))
            .expect("decoding should succeed")
            .expect("schema is registered");

        assert_eq!(
            envelope.event,
            ThingEvent::Added(Added {
                name: "a".to_string()
            })
        );
        assert_eq!(envelope.sequence, 7);
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if decoding fails
    fn ignores_unknown_type_and_version() {
        let registry = registry();
        assert!(
            registry
                .decode(&stored("thing.exploded", "v1"))
                .expect("unknown types are not errors")
                .is_none()
        );
        assert!(
            registry
                .decode(&stored("thing.added", "v2"))
                .expect("unknown versions are not errors")
                .is_none()
        );
    }

    #[test]
    fn lists_event_types_per_aggregate() {
        let registry = registry();
        assert_eq!(
            registry.event_types(&AggregateType::new("thing")),
            vec![EventType::new("thing.added")]
        );
        assert!(registry.event_types(&AggregateType::new("other")).is_empty());
        assert_eq!(registry.len(), 1);
    }
}
