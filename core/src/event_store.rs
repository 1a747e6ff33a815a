//! Event store backend trait.
//!
//! This is the contract a storage backend implements. It is deliberately
//! small: append with optimistic concurrency and unique constraints, filter,
//! and the two lookups the spooler needs. Validation, decoding and
//! subscriptions live one level up in [`Eventstore`](crate::eventstore::Eventstore).
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `warden-postgres`): production implementation
//! - `InMemoryEventStore` (in `warden-testing`): fast, deterministic testing
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! backend can be shared as `Arc<dyn EventStore>`.

use crate::aggregate::InstanceId;
use crate::error::EventstoreError;
use crate::event::{Command, StoredEvent};
use crate::query::SearchQuery;
use std::future::Future;
use std::pin::Pin;

/// Storage backend of the event log.
///
/// # Push contract
///
/// - All commands are written in one transaction together with their
///   unique-constraint changes, or nothing is written.
/// - A command with `expected_sequence = Some(n)` fails the push with
///   [`EventstoreError::ConcurrencyConflict`] unless its aggregate was at
///   aggregate sequence `n` before the push.
/// - An `Add` constraint colliding with an existing `(instance, type, field)`
///   fails the push with [`EventstoreError::UniqueConstraintViolation`];
///   `Remove` constraints are applied before `Add` constraints, so a command
///   may release and re-claim a value.
/// - Each event receives the next aggregate sequence of its aggregate and the
///   next sequence of its instance; both are gapless. Commits of one instance
///   are serialized so a sequence never becomes visible after a higher one.
pub trait EventStore: Send + Sync {
    /// Append commands as events.
    ///
    /// Returns the persisted events, in command order, with sequences and
    /// timestamps assigned.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: expected aggregate sequence no longer matches
    /// - `UniqueConstraintViolation`: a claimed value is already taken
    /// - `Internal`: storage failure
    fn push(
        &self,
        commands: Vec<Command>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + '_>>;

    /// Return events matching `query`, in query order.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    fn filter<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + 'a>>;

    /// Highest sequence among events matching `query`, or 0 if none match.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    fn latest_sequence<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventstoreError>> + Send + 'a>>;

    /// Instances that have at least one event, sorted.
    ///
    /// # Errors
    ///
    /// - `Internal`: storage failure
    fn instance_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceId>, EventstoreError>> + Send + '_>>;
}
