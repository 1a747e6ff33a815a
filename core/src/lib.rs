//! # Warden Core
//!
//! Core types and contracts of the Warden event log.
//!
//! Warden is the persistence substrate of an identity and access management
//! service: every state change is an immutable event appended to a shared,
//! multi-tenant log, and every read model is derived from it.
//!
//! ## Core Concepts
//!
//! - **Aggregate**: the unit of consistency, identified by
//!   `(instance, aggregate type, aggregate id)`
//! - **Command**: a not-yet-persisted event plus unique-constraint changes
//! - **`StoredEvent`**: a persisted event with its instance sequence and
//!   aggregate sequence
//! - **Write model**: an ephemeral fold of one aggregate used to validate a
//!   business command ([`write_model`], [`command`])
//! - **Projection**: an asynchronously maintained read model ([`projection`])
//!
//! ## Architecture
//!
//! - Storage backends implement the small [`event_store::EventStore`] trait
//! - The [`eventstore::Eventstore`] facade adds validation, typed decoding
//!   through an explicit [`registry::EventRegistry`], and subscriptions
//! - Consistency comes from optimistic concurrency on the aggregate sequence
//!   and from transactional unique constraints
//!
//! ## Example
//!
//! ```ignore
//! use warden_core::*;
//!
//! let registry = EventRegistry::new()
//!     .register("user", "user.added", "v1", IamEvent::UserAdded);
//! let eventstore = Eventstore::new(backend, registry);
//!
//! let model = eventstore.execute(&AddUser::new("inst-1", "org-1", "u-1", "alice")).await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod command;
pub mod error;
pub mod event;
pub mod event_store;
pub mod eventstore;
pub mod projection;
pub mod query;
pub mod registry;
pub mod subscription;
pub mod unique;
pub mod write_model;

pub use aggregate::{
    Aggregate, AggregateId, AggregateType, EventType, InstanceId, ParseIdError, ResourceOwner,
    Version,
};
pub use command::{WriteCommand, ensure_changed, ensure_exists, ensure_not_exists, expect_sequence_of};
pub use error::EventstoreError;
pub use event::{Command, Editor, Envelope, Event, EventError, StoredEvent};
pub use event_store::EventStore;
pub use eventstore::Eventstore;
pub use projection::{
    CatchUp, DeferReason, FailedEvent, Handler, LockError, Locker, Projection, ProjectionError,
    ProjectionStore, SYSTEM_SCOPE, ViewStore,
};
pub use query::{Order, QueryFilter, SearchQuery};
pub use registry::EventRegistry;
pub use subscription::{EventStream, Subscription, Subscriptions};
pub use unique::{UniqueConstraint, UniqueConstraintAction};
pub use write_model::{ObjectState, QueryReducer, WriteModel};

/// Environment traits for dependency injection.
///
/// Anything time-dependent (lock expiry, failure timestamps, run timestamps)
/// reads the clock through [`Clock`](environment::Clock) so tests can pin it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for time operations.
    ///
    /// # Example
    ///
    /// ```
    /// use warden_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
