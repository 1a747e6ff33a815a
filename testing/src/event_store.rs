//! In-memory event log.
//!
//! Implements the full push contract of [`EventStore`] (all-or-nothing
//! appends, optimistic concurrency, unique constraints, gapless sequences)
//! behind a single mutex, which serializes pushes the way the Postgres
//! backend serializes commits per instance.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use crate::mocks::test_clock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use warden_core::environment::Clock;
use warden_core::{
    AggregateId, AggregateType, Command, EventStore, EventstoreError, InstanceId, SearchQuery,
    StoredEvent, UniqueConstraintAction,
};

type AggregateKey = (InstanceId, AggregateType, AggregateId);
type ConstraintKey = (InstanceId, String, String);

#[derive(Default)]
struct Log {
    events: Vec<StoredEvent>,
    instance_sequences: HashMap<InstanceId, u64>,
    aggregate_sequences: HashMap<AggregateKey, u64>,
    constraints: HashSet<ConstraintKey>,
}

/// In-memory event store for fast, deterministic testing.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use warden_testing::InMemoryEventStore;
/// use warden_core::{EventStore, SearchQuery};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let events = store.filter(&SearchQuery::new()).await?;
/// assert!(events.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Create an empty store stamping events with [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty store stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            clock,
        }
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().unwrap().events.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events in append order.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.log.lock().unwrap().events.clone()
    }

    /// Whether `(instance, unique_type, field)` is currently claimed.
    #[must_use]
    pub fn has_constraint(&self, instance_id: &InstanceId, unique_type: &str, field: &str) -> bool {
        self.log.lock().unwrap().constraints.contains(&(
            instance_id.clone(),
            unique_type.to_string(),
            field.to_string(),
        ))
    }

    fn append(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventstoreError> {
        let mut log = self.log.lock().unwrap();

        for command in &commands {
            let Some(expected) = command.expected_sequence else {
                continue;
            };
            let key = aggregate_key(command);
            let actual = log.aggregate_sequences.get(&key).copied().unwrap_or_default();
            if actual != expected {
                let (instance_id, aggregate_type, aggregate_id) = key;
                return Err(EventstoreError::ConcurrencyConflict {
                    instance_id,
                    aggregate_type,
                    aggregate_id,
                    expected,
                    actual,
                });
            }
        }

        let mut constraints = log.constraints.clone();
        for (command, constraint) in constraint_changes(&commands, UniqueConstraintAction::Remove) {
            constraints.remove(&constraint_key(command, &constraint.unique_type, &constraint.field));
        }
        for (command, constraint) in constraint_changes(&commands, UniqueConstraintAction::Add) {
            let key = constraint_key(command, &constraint.unique_type, &constraint.field);
            if !constraints.insert(key) {
                return Err(EventstoreError::UniqueConstraintViolation {
                    unique_type: constraint.unique_type.clone(),
                    field: constraint.field.clone(),
                    message: constraint.error_message.clone(),
                });
            }
        }

        let created_at = self.clock.now();
        let mut pushed = Vec::with_capacity(commands.len());
        for command in commands {
            let instance_sequence = log
                .instance_sequences
                .entry(command.aggregate.instance_id.clone())
                .or_default();
            *instance_sequence += 1;
            let sequence = *instance_sequence;

            let aggregate_sequence = log.aggregate_sequences.entry(aggregate_key(&command)).or_default();
            *aggregate_sequence += 1;
            let aggregate_sequence = *aggregate_sequence;

            pushed.push(StoredEvent {
                aggregate: command.aggregate,
                event_type: command.event_type,
                sequence,
                aggregate_sequence,
                payload: command.payload,
                created_at,
                editor: command.editor,
            });
        }

        log.constraints = constraints;
        log.events.extend(pushed.iter().cloned());
        Ok(pushed)
    }

    fn matching(&self, query: &SearchQuery) -> Vec<StoredEvent> {
        self.log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventStore for InMemoryEventStore {
    fn push(
        &self,
        commands: Vec<Command>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + '_>> {
        Box::pin(async move { self.append(commands) })
    }

    fn filter<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut events = self.matching(query);
            query.finish(&mut events);
            Ok(events)
        })
    }

    fn latest_sequence<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventstoreError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .matching(query)
                .iter()
                .map(|event| event.sequence)
                .max()
                .unwrap_or_default())
        })
    }

    fn instance_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceId>, EventstoreError>> + Send + '_>> {
        Box::pin(async move {
            let log = self.log.lock().unwrap();
            let instances: BTreeSet<InstanceId> = log.instance_sequences.keys().cloned().collect();
            Ok(instances.into_iter().collect())
        })
    }
}

fn aggregate_key(command: &Command) -> AggregateKey {
    (
        command.aggregate.instance_id.clone(),
        command.aggregate.aggregate_type.clone(),
        command.aggregate.id.clone(),
    )
}

fn constraint_key(command: &Command, unique_type: &str, field: &str) -> ConstraintKey {
    (
        command.aggregate.instance_id.clone(),
        unique_type.to_string(),
        field.to_string(),
    )
}

fn constraint_changes(
    commands: &[Command],
    action: UniqueConstraintAction,
) -> impl Iterator<Item = (&Command, &warden_core::UniqueConstraint)> {
    commands.iter().flat_map(move |command| {
        command
            .unique_constraints
            .iter()
            .filter(move |constraint| constraint.action == action)
            .map(move |constraint| (command, constraint))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use warden_core::{Aggregate, Editor, EventType, QueryFilter, UniqueConstraint};

    fn command(instance: &str, id: &str) -> Command {
        Command {
            aggregate: Aggregate::new("user", id, instance, "org", "v1"),
            event_type: EventType::new("user.added"),
            payload: vec![1, 2, 3],
            editor: Editor::new("test", "tester"),
            unique_constraints: Vec::new(),
            expected_sequence: None,
        }
    }

    #[tokio::test]
    async fn sequences_are_per_instance_and_per_aggregate() {
        let store = InMemoryEventStore::new();
        let pushed = store
            .push(vec![
                command("a", "u1"),
                command("a", "u1"),
                command("b", "u1"),
                command("a", "u2"),
            ])
            .await
            .unwrap();

        let sequences: Vec<(u64, u64)> = pushed
            .iter()
            .map(|e| (e.sequence, e.aggregate_sequence))
            .collect();
        assert_eq!(sequences, vec![(1, 1), (2, 2), (1, 1), (3, 1)]);
        assert_eq!(
            store.instance_ids().await.unwrap(),
            vec![InstanceId::new("a"), InstanceId::new("b")]
        );
    }

    #[tokio::test]
    async fn stale_expected_sequence_conflicts_without_writing() {
        let store = InMemoryEventStore::new();
        store.push(vec![command("a", "u1")]).await.unwrap();

        let result = store
            .push(vec![command("a", "u2"), command("a", "u1").expect_sequence(0)])
            .await;

        assert!(matches!(
            result,
            Err(EventstoreError::ConcurrencyConflict { expected: 0, actual: 1, .. })
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_applied_before_add() {
        let store = InMemoryEventStore::new();
        store
            .push(vec![
                command("a", "u1").with_unique_constraint(UniqueConstraint::add("usernames", "alice", "taken")),
            ])
            .await
            .unwrap();

        let rename = command("a", "u1")
            .with_unique_constraint(UniqueConstraint::add("usernames", "alice", "taken"))
            .with_unique_constraint(UniqueConstraint::remove("usernames", "alice"));
        assert!(store.push(vec![rename]).await.is_ok());

        let clash = command("a", "u2")
            .with_unique_constraint(UniqueConstraint::add("usernames", "alice", "taken"));
        assert!(matches!(
            store.push(vec![clash]).await,
            Err(EventstoreError::UniqueConstraintViolation { .. })
        ));
        assert!(store.has_constraint(&InstanceId::new("a"), "usernames", "alice"));
    }

    #[tokio::test]
    async fn filter_and_latest_sequence_respect_query() {
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            store.push(vec![command("a", "u1")]).await.unwrap();
        }

        let query = SearchQuery::new()
            .filter(QueryFilter::new().instance("a").sequence_greater(1))
            .limit(1);
        let events = store.filter(&query).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(store.latest_sequence(&query).await.unwrap(), 3);
    }
}
