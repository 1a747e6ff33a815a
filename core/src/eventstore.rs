//! The `Eventstore` facade.
//!
//! Wraps a storage backend with the pieces every caller needs:
//!
//! - command validation before any storage access
//! - the [`EventRegistry`] used to decode events for reducers
//! - the subscription hub notified after every successful push
//!
//! # Example
//!
//! ```ignore
//! let eventstore = Eventstore::new(Arc::new(PostgresEventStore::from_pool(pool)), registry);
//!
//! let mut user = UserWriteModel::new("u-1", "inst-1", "");
//! eventstore.filter_to_query_reducer(&mut user).await?;
//! ```

use crate::aggregate::{AggregateType, InstanceId};
use crate::error::EventstoreError;
use crate::event::{Command, Envelope, StoredEvent};
use crate::event_store::EventStore;
use crate::query::SearchQuery;
use crate::registry::EventRegistry;
use crate::subscription::{Subscription, Subscriptions};
use crate::write_model::QueryReducer;
use std::fmt;
use std::sync::Arc;

/// Event log facade shared by the command pipeline and projections.
pub struct Eventstore<E> {
    backend: Arc<dyn EventStore>,
    registry: Arc<EventRegistry<E>>,
    subscriptions: Subscriptions,
}

impl<E> Clone for Eventstore<E> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            subscriptions: self.subscriptions.clone(),
        }
    }
}

impl<E> fmt::Debug for Eventstore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eventstore")
            .field("registry", &self.registry)
            .field("subscribers", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl<E: Send + Sync + 'static> Eventstore<E> {
    /// Create a facade over `backend`, decoding with `registry`.
    #[must_use]
    pub fn new(backend: Arc<dyn EventStore>, registry: EventRegistry<E>) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            subscriptions: Subscriptions::new(),
        }
    }

    /// The schema registry.
    #[must_use]
    pub fn registry(&self) -> &EventRegistry<E> {
        &self.registry
    }

    /// The storage backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn EventStore> {
        &self.backend
    }

    /// Validate and append commands, then notify subscribers.
    ///
    /// An empty command list is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: a command is malformed (nothing is written)
    /// - `ConcurrencyConflict`, `UniqueConstraintViolation`, `Internal`: from the backend
    pub async fn push(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventstoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        for command in &commands {
            validate_command(command)?;
        }

        let pushed = self.backend.push(commands).await?;

        metrics::counter!("eventstore.push.events").increment(pushed.len() as u64);
        tracing::debug!(
            events = pushed.len(),
            last_sequence = pushed.last().map(|e| e.sequence),
            "Pushed events"
        );

        self.subscriptions.notify(&pushed);
        Ok(pushed)
    }

    /// Raw events matching `query`.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    pub async fn filter(&self, query: &SearchQuery) -> Result<Vec<StoredEvent>, EventstoreError> {
        self.backend.filter(query).await
    }

    /// Decoded events matching `query`; unregistered event types are skipped.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure or undecodable payload
    pub async fn filter_envelopes(
        &self,
        query: &SearchQuery,
    ) -> Result<Vec<Envelope<E>>, EventstoreError> {
        let events = self.backend.filter(query).await?;
        Ok(self.registry.decode_all(&events)?)
    }

    /// Load a reducer: filter its query, decode, append and reduce.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure or undecodable payload
    /// - any error returned by the reducer's `reduce`
    pub async fn filter_to_query_reducer<R>(&self, reducer: &mut R) -> Result<(), EventstoreError>
    where
        R: QueryReducer<Event = E>,
    {
        let query = reducer.query();
        let envelopes = self.filter_envelopes(&query).await?;
        reducer.append_events(envelopes);
        reducer.reduce()
    }

    /// Highest sequence matching `query`, or 0.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    pub async fn latest_sequence(&self, query: &SearchQuery) -> Result<u64, EventstoreError> {
        self.backend.latest_sequence(query).await
    }

    /// Instances with at least one event.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    pub async fn instance_ids(&self) -> Result<Vec<InstanceId>, EventstoreError> {
        self.backend.instance_ids().await
    }

    /// Subscribe to events pushed through this facade (or any of its clones).
    pub fn subscribe<I, T>(&self, aggregate_types: I) -> Subscription
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.subscriptions.subscribe(aggregate_types)
    }
}

fn validate_command(command: &Command) -> Result<(), EventstoreError> {
    if let Some(field) = command.aggregate.missing_field() {
        return Err(EventstoreError::InvalidArgument(format!(
            "command is missing {field}"
        )));
    }
    if command.event_type.is_empty() {
        return Err(EventstoreError::InvalidArgument(
            "command is missing event type".to_string(),
        ));
    }
    if let Some(constraint) = command
        .unique_constraints
        .iter()
        .find(|c| c.unique_type.is_empty() || c.field.is_empty())
    {
        return Err(EventstoreError::InvalidArgument(format!(
            "unique constraint {:?}/{:?} must have a type and a field",
            constraint.unique_type, constraint.field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregate, EventType};
    use crate::event::Editor;
    use crate::unique::UniqueConstraint;

    fn command(aggregate: Aggregate) -> Command {
        Command {
            aggregate,
            event_type: EventType::new("user.added"),
            payload: Vec::new(),
            editor: Editor::default(),
            unique_constraints: Vec::new(),
            expected_sequence: None,
        }
    }

    #[test]
    fn rejects_missing_identity() {
        let result = validate_command(&command(Aggregate::new("user", "", "inst", "org", "v1")));
        assert!(matches!(result, Err(EventstoreError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_empty_constraint_field() {
        let cmd = command(Aggregate::new("user", "u", "inst", "org", "v1"))
            .with_unique_constraint(UniqueConstraint::add("usernames", "", "taken"));
        assert!(matches!(
            validate_command(&cmd),
            Err(EventstoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn accepts_well_formed_command() {
        let cmd = command(Aggregate::new("user", "u", "inst", "org", "v1"));
        assert!(validate_command(&cmd).is_ok());
    }
}
