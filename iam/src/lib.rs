//! Users on the Warden event log.
//!
//! A small identity domain showing both sides of the engine:
//!
//! - **Write side**: [`UserWriteModel`] folds a user's events; the commands in
//!   [`user`] validate against it and push new events with their username
//!   constraint changes
//! - **Read side**: [`UserProjection`] keeps a users view current through the
//!   spooler
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_core::Eventstore;
//! use warden_iam::{AddUser, registry};
//! use warden_testing::InMemoryEventStore;
//!
//! let eventstore = Eventstore::new(Arc::new(InMemoryEventStore::new()), registry());
//! let user = eventstore.execute(&AddUser::new("inst-1", "org-1", "u-1", "alice")).await?;
//! assert_eq!(user.username, "alice");
//! ```

pub mod events;
pub mod projection;
pub mod user;

pub use events::{
    IamEvent, USER_AGGREGATE, USER_VERSION, USERNAMES, UserAdded, UserDeactivated,
    UserReactivated, UserRemoved, UsernameChanged, registry, username_key,
};
pub use projection::{USERS_VIEW, UserProjection, UserRow, UserStatus};
pub use user::{
    AddUser, ChangeUsername, DeactivateUser, ReactivateUser, RemoveUser, UserWriteModel,
};
