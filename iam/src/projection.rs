//! Users read model.
//!
//! One row per user, keyed `user:{instance}:{user_id}` in any
//! [`ProjectionStore`]. Rows remember the sequence of the last applied event
//! so redelivered events are ignored. A removed user keeps a
//! [`UserStatus::Removed`] tombstone, which [`UserProjection::get`] hides.

use crate::events::{IamEvent, USER_AGGREGATE};
use serde::{Deserialize, Serialize};
use warden_core::projection::Result;
use warden_core::{
    AggregateType, DateTime, Envelope, Projection, ProjectionError, ProjectionStore, Utc,
};

/// View name of [`UserProjection`].
pub const USERS_VIEW: &str = "projections.users";

/// Whether a user may sign in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    /// Signed-in allowed.
    Active,
    /// Locked out.
    Inactive,
    /// Deleted; the row is kept as a tombstone.
    Removed,
}

/// A row of the users view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    /// Tenant instance.
    pub instance_id: String,
    /// User id.
    pub user_id: String,
    /// Owning organisation.
    pub resource_owner: String,
    /// Login name.
    pub username: String,
    /// Name shown in UIs.
    pub display_name: String,
    /// Sign-in status.
    pub status: UserStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last applied event.
    pub changed_at: DateTime<Utc>,
    /// Sequence of the last applied event.
    pub sequence: u64,
}

/// Maintains [`UserRow`]s from user events.
#[derive(Clone, Debug)]
pub struct UserProjection<S> {
    store: S,
}

impl<S: ProjectionStore> UserProjection<S> {
    /// Create a projection writing to `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Store key of one user.
    #[must_use]
    pub fn key(instance_id: &str, user_id: &str) -> String {
        format!("user:{instance_id}:{user_id}")
    }

    /// Look a user up. Removed users are not returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the store fails or the row does not decode.
    pub async fn get(&self, instance_id: &str, user_id: &str) -> Result<Option<UserRow>> {
        Ok(self
            .load(instance_id, user_id)
            .await?
            .filter(|row| row.status != UserStatus::Removed))
    }

    async fn load(&self, instance_id: &str, user_id: &str) -> Result<Option<UserRow>> {
        match self.store.get(&Self::key(instance_id, user_id)).await? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| ProjectionError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, row: &UserRow) -> Result<()> {
        let bytes =
            bincode::serialize(row).map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        self.store
            .save(&Self::key(&row.instance_id, &row.user_id), &bytes)
            .await
    }

    /// Apply `change` to an existing row unless the event was already applied.
    async fn update(
        &self,
        envelope: &Envelope<IamEvent>,
        change: impl FnOnce(&mut UserRow),
    ) -> Result<()> {
        let aggregate = &envelope.aggregate;
        let Some(mut row) = self
            .load(aggregate.instance_id.as_str(), aggregate.id.as_str())
            .await?
        else {
            tracing::warn!(
                instance = %aggregate.instance_id,
                user = %aggregate.id,
                sequence = envelope.sequence,
                "User row missing, event ignored"
            );
            return Ok(());
        };
        if row.sequence >= envelope.sequence {
            return Ok(());
        }
        change(&mut row);
        row.sequence = envelope.sequence;
        row.changed_at = envelope.created_at;
        self.save(&row).await
    }
}

impl<S> Projection for UserProjection<S>
where
    S: ProjectionStore + 'static,
{
    type Event = IamEvent;

    fn name(&self) -> &str {
        USERS_VIEW
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        vec![AggregateType::new(USER_AGGREGATE)]
    }

    async fn reduce(&self, envelope: &Envelope<IamEvent>) -> Result<()> {
        let aggregate = &envelope.aggregate;
        match &envelope.event {
            IamEvent::UserAdded(e) => {
                let existing = self
                    .load(aggregate.instance_id.as_str(), aggregate.id.as_str())
                    .await?;
                if existing.is_some_and(|row| row.sequence >= envelope.sequence) {
                    return Ok(());
                }
                self.save(&UserRow {
                    instance_id: aggregate.instance_id.to_string(),
                    user_id: aggregate.id.to_string(),
                    resource_owner: aggregate.resource_owner.to_string(),
                    username: e.username.clone(),
                    display_name: e.display_name.clone(),
                    status: UserStatus::Active,
                    created_at: envelope.created_at,
                    changed_at: envelope.created_at,
                    sequence: envelope.sequence,
                })
                .await
            }
            IamEvent::UsernameChanged(e) => {
                self.update(envelope, |row| row.username.clone_from(&e.username))
                    .await
            }
            IamEvent::UserDeactivated(_) => {
                self.update(envelope, |row| row.status = UserStatus::Inactive)
                    .await
            }
            IamEvent::UserReactivated(_) => {
                self.update(envelope, |row| row.status = UserStatus::Active)
                    .await
            }
            IamEvent::UserRemoved(_) => {
                self.update(envelope, |row| row.status = UserStatus::Removed)
                    .await
            }
        }
    }
}
