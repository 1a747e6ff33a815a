//! `PostgreSQL` lock table.

use sqlx::postgres::PgPool;
use std::time::Duration;
use warden_core::projection::BoxFuture;
use warden_core::{LockError, Locker};

/// Cross-process view locks in the `locks` table.
///
/// A renewal is a single upsert that only touches the row if the caller
/// already owns it or the current lock has expired; expiry is judged by the
/// database clock, so the lockers' clocks need not agree.
#[derive(Clone, Debug)]
pub struct PostgresLocker {
    pool: PgPool,
}

impl PostgresLocker {
    /// Create a locker over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Locker for PostgresLocker {
    fn renew<'a>(
        &'a self,
        locker_id: &'a str,
        view: &'a str,
        lock_duration: Duration,
        instance_scope: &'a str,
    ) -> BoxFuture<'a, Result<(), LockError>> {
        Box::pin(async move {
            let millis = i64::try_from(lock_duration.as_millis()).unwrap_or(i64::MAX);
            let result = sqlx::query(
                "INSERT INTO locks (locker_id, view_name, instance_id, locked_until)
                 VALUES ($1, $2, $3, now() + $4::bigint * interval '1 millisecond')
                 ON CONFLICT (view_name, instance_id) DO UPDATE
                 SET locker_id = EXCLUDED.locker_id, locked_until = EXCLUDED.locked_until
                 WHERE locks.locker_id = EXCLUDED.locker_id OR locks.locked_until < now()",
            )
            .bind(locker_id)
            .bind(view)
            .bind(instance_scope)
            .bind(millis)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Storage(format!("Failed to renew lock: {e}")))?;

            if result.rows_affected() == 0 {
                return Err(LockError::AlreadyLocked {
                    view: view.to_string(),
                    scope: instance_scope.to_string(),
                });
            }
            Ok(())
        })
    }
}
