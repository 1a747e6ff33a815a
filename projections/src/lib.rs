//! Projection engine for Warden.
//!
//! # Overview
//!
//! This crate keeps read models consistent with the event log:
//! - **`ProjectionHandler`**: drives a typed `Projection` as a spooler handler,
//!   with cursor bookkeeping, bounded retry, poison-event skipping and
//!   subscription-triggered catch-up
//! - **`Spooler`**: worker pool that runs every handler on a schedule under
//!   a renewable cross-process lock
//! - **Configuration**: `SpoolerConfig` / `HandlerConfig` with env overrides
//!
//! Storage is pluggable through the `ViewStore`, `Locker` and `EventStore`
//! traits of `warden-core`; Postgres implementations live in
//! `warden-postgres`, in-memory ones in `warden-testing`.
//!
//! # Delivery
//!
//! Events are delivered at least once. A crash between reducing an event and
//! advancing the cursor reprocesses it, so reducers must be idempotent.
//!
//! # Example
//!
//! ```ignore
//! use warden_projections::{HandlerConfig, ProjectionHandler, Spooler, SpoolerConfig};
//!
//! let users = ProjectionHandler::new(UserProjection::new(store), eventstore.clone(), view_store, HandlerConfig::default());
//!
//! let handle = Spooler::new(SpoolerConfig::default(), eventstore.backend().clone(), locker)
//!     .with_handler(Arc::new(users))
//!     .start();
//! ```

pub mod config;
pub mod handler;
pub mod lock;
pub mod spooler;

pub use config::{ConfigError, HandlerConfig, SpoolerConfig};
pub use handler::ProjectionHandler;
pub use lock::{CancelToken, LockRenewal};
pub use spooler::{Spooler, SpoolerHandle, run_cycle};
