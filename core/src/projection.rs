//! Projection contracts: read models built asynchronously from the event log.
//!
//! # Overview
//!
//! ```text
//! Eventstore::push ──► events ──► Subscription ──► Handler::catch_up
//!                         │
//!                         └────► Spooler (poll) ──► Handler::process ──► read model
//!                                                         │
//!                                                         ▼
//!                                              ViewStore (CurrentSequence,
//!                                                         FailedEvent)
//! ```
//!
//! - [`Projection`]: typed read-model logic (what an event means for the view)
//! - [`Handler`]: the dyn-compatible contract the spooler drives; implemented
//!   by `ProjectionHandler` in `warden-projections` for any [`Projection`]
//! - [`ViewStore`]: durable cursors and the poison-event ledger
//! - [`Locker`]: the cross-process lock table
//! - [`ProjectionStore`]: generic key/value storage for simple read models
//!
//! Delivery is at-least-once: reducers must be idempotent upserts/deletes.

use crate::aggregate::{AggregateType, InstanceId};
use crate::error::EventstoreError;
use crate::event::{Envelope, StoredEvent};
use crate::query::SearchQuery;
use crate::subscription::Subscription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by the dyn-compatible traits of this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scope used for locks that cover all instances of a view.
pub const SYSTEM_SCOPE: &str = "system";

/// Error type for projection operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectionError {
    /// Read-model or view-store backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A reducer could not apply an event
    #[error("Failed to reduce event {sequence} of instance {instance_id}: {reason}")]
    Reduce {
        /// Instance of the failing event.
        instance_id: InstanceId,
        /// Sequence of the failing event.
        sequence: u64,
        /// Reducer message.
        reason: String,
    },

    /// Reading the event log failed
    #[error("Eventstore error: {0}")]
    Eventstore(#[from] EventstoreError),

    /// The cycle was cancelled (lock lost or shutdown)
    #[error("Projection cycle cancelled")]
    Cancelled,

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl ProjectionError {
    /// Whether this error came from a reducer and is subject to bounded retry.
    #[must_use]
    pub const fn is_reduce(&self) -> bool {
        matches!(self, Self::Reduce { .. })
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Typed read-model logic.
///
/// # Example
///
/// ```ignore
/// impl Projection for UserProjection {
///     type Event = IamEvent;
///
///     fn name(&self) -> &str {
///         "projections.users"
///     }
///
///     fn aggregate_types(&self) -> Vec<AggregateType> {
///         vec![AggregateType::new("user")]
///     }
///
///     async fn reduce(&self, envelope: &Envelope<IamEvent>) -> Result<()> {
///         match &envelope.event {
///             IamEvent::UserAdded(e) => self.store.save(&key(envelope), &row(e)).await,
///             IamEvent::UserRemoved(_) => self.store.delete(&key(envelope)).await,
///             _ => Ok(()),
///         }
///     }
/// }
/// ```
pub trait Projection: Send + Sync + 'static {
    /// Decoded event enum.
    type Event: Send + Sync + 'static;

    /// Unique view name; keys cursors, failures and locks.
    fn name(&self) -> &str;

    /// Aggregate types the view reads.
    fn aggregate_types(&self) -> Vec<AggregateType>;

    /// Apply one event as an idempotent upsert or delete.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event cannot be applied.
    fn reduce(&self, envelope: &Envelope<Self::Event>) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of a subscription-triggered catch-up burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// The cursor already covers the notified event.
    UpToDate,
    /// Events were reduced and the cursor advanced to `sequence`.
    Applied {
        /// Number of events reduced.
        events: usize,
        /// New cursor.
        sequence: u64,
    },
    /// The burst was abandoned; the next scheduled poll picks the events up.
    Deferred(DeferReason),
}

/// Why a catch-up burst was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The unprocessed range exceeds the bulk limit.
    TooManyEvents,
    /// A fetched event is at or behind the cursor; another processor moved it.
    StaleSequence,
    /// Reducing or bookkeeping failed.
    Failed,
}

/// The contract the spooler drives.
///
/// Methods return [`BoxFuture`] so handlers can be held as `Arc<dyn Handler>`.
pub trait Handler: Send + Sync {
    /// View name.
    fn view_model(&self) -> &str;

    /// Aggregate types the view reads.
    fn aggregate_types(&self) -> &[AggregateType];

    /// Maximum events fetched per query.
    fn query_limit(&self) -> usize;

    /// Minimum time between two scheduled runs.
    fn minimum_cycle_duration(&self) -> Duration;

    /// TTL of the view's lock.
    fn lock_duration(&self) -> Duration;

    /// Instances processed per query.
    fn concurrent_instances(&self) -> usize;

    /// Backoff before a failed batch is retried.
    fn retry_failed_after(&self) -> Duration;

    /// Query for the unprocessed events of `instance_ids`, each instance
    /// starting after its durable cursor.
    fn event_query<'a>(&'a self, instance_ids: &'a [InstanceId]) -> BoxFuture<'a, Result<SearchQuery>>;

    /// Apply one event to the read model.
    fn reduce<'a>(&'a self, event: &'a StoredEvent) -> BoxFuture<'a, Result<()>>;

    /// Record a reduce failure. Returns `Ok` if the event was skipped and
    /// processing may continue, the original error otherwise.
    fn on_error<'a>(&'a self, event: &'a StoredEvent, error: ProjectionError) -> BoxFuture<'a, Result<()>>;

    /// Called after a cycle drained every instance without error.
    fn on_success(&self) -> BoxFuture<'_, Result<()>>;

    /// Reduce `events` in order, advancing cursors and routing failures
    /// through [`Handler::on_error`].
    fn process<'a>(&'a self, events: &'a [StoredEvent]) -> BoxFuture<'a, Result<()>>;

    /// Subscribe to pushes of the handler's aggregate types, if supported.
    fn subscribe(&self) -> Option<Subscription>;

    /// React to a pushed event by reducing the unprocessed range up to it.
    fn catch_up<'a>(&'a self, event: &'a StoredEvent) -> BoxFuture<'a, Result<CatchUp>>;
}

/// A poison-event ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    /// View the event failed in.
    pub view_name: String,
    /// Instance of the event.
    pub instance_id: InstanceId,
    /// Sequence of the event.
    pub failed_sequence: u64,
    /// Number of failed attempts.
    pub failure_count: u32,
    /// Last error message.
    pub error_message: String,
    /// Time of the last failure.
    pub last_failed: DateTime<Utc>,
}

/// Durable projection bookkeeping: cursors, failures and run timestamps.
///
/// # Invariants
///
/// - Cursors never regress: updates keep the maximum.
/// - A failure counter only resets when the event is reduced successfully
///   ([`ViewStore::mark_processed`]); skipping keeps the record.
pub trait ViewStore: Send + Sync {
    /// Cursor of `(view, instance)`, 0 if the view never processed the instance.
    fn current_sequence<'a>(&'a self, view: &'a str, instance_id: &'a InstanceId) -> BoxFuture<'a, Result<u64>>;

    /// Cursors of several instances; missing instances are reported as 0.
    fn current_sequences<'a>(
        &'a self,
        view: &'a str,
        instance_ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<HashMap<InstanceId, u64>>>;

    /// Advance the cursor to `sequence` and clear a failure record of it.
    fn mark_processed<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>>;

    /// Force-advance the cursor past a poison event, keeping its failure record.
    fn skip_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>>;

    /// Increment the failure counter of an event and return the updated record.
    fn record_failure<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<FailedEvent>>;

    /// Failure record of one event.
    fn failed_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<Option<FailedEvent>>>;

    /// All failure records of a view, for audit.
    fn failed_events<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Vec<FailedEvent>>>;

    /// Timestamp a successful run.
    fn record_success<'a>(&'a self, view: &'a str, at: DateTime<Utc>) -> BoxFuture<'a, Result<()>>;

    /// Timestamp of the last successful run.
    fn last_successful_run<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Option<DateTime<Utc>>>>;
}

/// Errors of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Another locker holds an unexpired lock.
    #[error("View {view} is locked in scope {scope} by another locker")]
    AlreadyLocked {
        /// View name.
        view: String,
        /// Instance scope.
        scope: String,
    },

    /// Lock table failure.
    #[error("Lock storage error: {0}")]
    Storage(String),
}

/// The cross-process lock table.
///
/// `renew` is the only coordination primitive between processes: it
/// atomically acquires the lock if it is free or expired, extends it if
/// `locker_id` already holds it, and fails otherwise.
pub trait Locker: Send + Sync {
    /// Renew or acquire `(view, instance_scope)` for `lock_duration`.
    fn renew<'a>(
        &'a self,
        locker_id: &'a str,
        view: &'a str,
        lock_duration: Duration,
        instance_scope: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), LockError>>;
}

/// Generic key/value storage for read models.
///
/// Implementations handle upserts, which keeps reducers built on it idempotent.
pub trait ProjectionStore: Send + Sync {
    /// Save projection data under `key` (insert or update).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if save fails.
    fn save(&self, key: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Get projection data by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if retrieval fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete projection data by key. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if deletion fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if projection data exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if check fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_errors_are_retryable() {
        let error = ProjectionError::Reduce {
            instance_id: InstanceId::new("inst"),
            sequence: 4,
            reason: "boom".to_string(),
        };
        assert!(error.is_reduce());
        assert!(error.to_string().contains("event 4"));
        assert!(!ProjectionError::Storage("down".to_string()).is_reduce());
    }

    #[test]
    fn eventstore_errors_convert() {
        let error: ProjectionError = EventstoreError::Internal("db".to_string()).into();
        assert!(matches!(error, ProjectionError::Eventstore(_)));
    }
}
