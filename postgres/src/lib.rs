//! `PostgreSQL` backends for Warden.
//!
//! This crate provides the production implementations of the storage
//! contracts in `warden-core`:
//!
//! - [`PostgresEventStore`]: the event log with optimistic concurrency and
//!   transactional unique constraints
//! - [`PostgresViewStore`]: projection cursors, failed events and run timestamps
//! - [`PostgresLocker`]: the cross-process lock table used by the spooler
//! - [`PostgresProjectionStore`]: generic key/value read-model storage
//!
//! The schema lives in `migrations/` and is applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use warden_postgres::{PostgresConfig, PostgresEventStore, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PostgresConfig::from_env()?.connect().await?;
//!     migrate(&pool).await?;
//!     let event_store = PostgresEventStore::from_pool(pool);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod event_store;
pub mod locker;
pub mod projection_store;
pub mod view_store;

pub use config::{PostgresConfig, PostgresError};
pub use event_store::PostgresEventStore;
pub use locker::PostgresLocker;
pub use projection_store::{DEFAULT_TABLE, PostgresProjectionStore};
pub use view_store::PostgresViewStore;

use sqlx::PgPool;
use warden_core::EventstoreError;

/// Apply the bundled migrations.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Sequences are stored as `BIGINT`.
pub(crate) fn to_db(value: u64) -> Result<i64, EventstoreError> {
    i64::try_from(value)
        .map_err(|_| EventstoreError::InvalidArgument(format!("sequence {value} out of range")))
}

/// Stored sequences are never negative.
pub(crate) fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
