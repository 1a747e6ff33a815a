//! `PostgreSQL` projection bookkeeping: cursors, the poison-event ledger and
//! run timestamps.
//!
//! Cursor updates use `GREATEST`, so a late write from a slower processor
//! can never move a view backwards.

use crate::{from_db, to_db};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use warden_core::projection::{BoxFuture, Result};
use warden_core::{FailedEvent, InstanceId, ProjectionError, ViewStore};

const UPSERT_CURSOR: &str = "INSERT INTO current_sequences (view_name, instance_id, current_sequence, updated_at)
     VALUES ($1, $2, $3, now())
     ON CONFLICT (view_name, instance_id) DO UPDATE
     SET current_sequence = GREATEST(current_sequences.current_sequence, EXCLUDED.current_sequence),
         updated_at = now()";

/// `PostgreSQL` implementation of [`ViewStore`].
///
/// # Example
///
/// ```no_run
/// use warden_postgres::PostgresViewStore;
/// use warden_core::ViewStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let views = PostgresViewStore::new(pool);
///
/// for failed in views.failed_events("projections.users").await? {
///     println!("{} #{} failed {} times", failed.instance_id, failed.failed_sequence, failed.failure_count);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresViewStore {
    pool: PgPool,
}

impl PostgresViewStore {
    /// Create a view store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn advance(
        &self,
        view: &str,
        instance_id: &InstanceId,
        sequence: u64,
        clear_failure: bool,
    ) -> Result<()> {
        let sequence = to_db(sequence).map_err(|e| ProjectionError::Storage(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(storage("begin transaction"))?;

        sqlx::query(UPSERT_CURSOR)
            .bind(view)
            .bind(instance_id.as_str())
            .bind(sequence)
            .execute(&mut *tx)
            .await
            .map_err(storage("update cursor"))?;

        if clear_failure {
            sqlx::query(
                "DELETE FROM failed_events
                 WHERE view_name = $1 AND instance_id = $2 AND failed_sequence = $3",
            )
            .bind(view)
            .bind(instance_id.as_str())
            .bind(sequence)
            .execute(&mut *tx)
            .await
            .map_err(storage("clear failed event"))?;
        }

        tx.commit().await.map_err(storage("commit cursor"))
    }
}

impl ViewStore for PostgresViewStore {
    fn current_sequence<'a>(&'a self, view: &'a str, instance_id: &'a InstanceId) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                "SELECT current_sequence FROM current_sequences
                 WHERE view_name = $1 AND instance_id = $2",
            )
            .bind(view)
            .bind(instance_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("load cursor"))?;
            Ok(row.map(|(sequence,)| from_db(sequence)).unwrap_or_default())
        })
    }

    fn current_sequences<'a>(
        &'a self,
        view: &'a str,
        instance_ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<HashMap<InstanceId, u64>>> {
        Box::pin(async move {
            let ids: Vec<String> = instance_ids.iter().map(ToString::to_string).collect();
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT instance_id, current_sequence FROM current_sequences
                 WHERE view_name = $1 AND instance_id = ANY($2)",
            )
            .bind(view)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("load cursors"))?;

            let mut cursors: HashMap<InstanceId, u64> =
                instance_ids.iter().map(|id| (id.clone(), 0)).collect();
            for (instance_id, sequence) in rows {
                cursors.insert(InstanceId::new(instance_id), from_db(sequence));
            }
            Ok(cursors)
        })
    }

    fn mark_processed<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.advance(view, instance_id, sequence, true))
    }

    fn skip_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.advance(view, instance_id, sequence, false))
    }

    fn record_failure<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<FailedEvent>> {
        Box::pin(async move {
            let row = sqlx::query(
                "INSERT INTO failed_events (view_name, instance_id, failed_sequence, failure_count, error_message, last_failed)
                 VALUES ($1, $2, $3, 1, $4, now())
                 ON CONFLICT (view_name, instance_id, failed_sequence) DO UPDATE
                 SET failure_count = failed_events.failure_count + 1,
                     error_message = EXCLUDED.error_message,
                     last_failed = EXCLUDED.last_failed
                 RETURNING view_name, instance_id, failed_sequence, failure_count, error_message, last_failed",
            )
            .bind(view)
            .bind(instance_id.as_str())
            .bind(to_db(sequence).map_err(|e| ProjectionError::Storage(e.to_string()))?)
            .bind(error_message)
            .fetch_one(&self.pool)
            .await
            .map_err(storage("record failed event"))?;

            let failed = failed_event_from_row(&row).map_err(storage("decode failed event"))?;
            tracing::warn!(
                view,
                instance = %instance_id,
                sequence,
                failures = failed.failure_count,
                error = error_message,
                "Recorded failed event"
            );
            Ok(failed)
        })
    }

    fn failed_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<Option<FailedEvent>>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT view_name, instance_id, failed_sequence, failure_count, error_message, last_failed
                 FROM failed_events
                 WHERE view_name = $1 AND instance_id = $2 AND failed_sequence = $3",
            )
            .bind(view)
            .bind(instance_id.as_str())
            .bind(to_db(sequence).map_err(|e| ProjectionError::Storage(e.to_string()))?)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("load failed event"))?;

            row.as_ref()
                .map(failed_event_from_row)
                .transpose()
                .map_err(storage("decode failed event"))
        })
    }

    fn failed_events<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Vec<FailedEvent>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT view_name, instance_id, failed_sequence, failure_count, error_message, last_failed
                 FROM failed_events
                 WHERE view_name = $1
                 ORDER BY instance_id, failed_sequence",
            )
            .bind(view)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("list failed events"))?;

            rows.iter()
                .map(failed_event_from_row)
                .collect::<std::result::Result<_, _>>()
                .map_err(storage("decode failed event"))
        })
    }

    fn record_success<'a>(&'a self, view: &'a str, at: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO last_successful_runs (view_name, last_run)
                 VALUES ($1, $2)
                 ON CONFLICT (view_name) DO UPDATE SET last_run = EXCLUDED.last_run",
            )
            .bind(view)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(storage("record successful run"))?;
            Ok(())
        })
    }

    fn last_successful_run<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Option<DateTime<Utc>>>> {
        Box::pin(async move {
            let row: Option<(DateTime<Utc>,)> =
                sqlx::query_as("SELECT last_run FROM last_successful_runs WHERE view_name = $1")
                    .bind(view)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage("load last successful run"))?;
            Ok(row.map(|(at,)| at))
        })
    }
}

fn failed_event_from_row(row: &PgRow) -> std::result::Result<FailedEvent, sqlx::Error> {
    let failure_count: i32 = row.try_get("failure_count")?;
    Ok(FailedEvent {
        view_name: row.try_get("view_name")?,
        instance_id: InstanceId::new(row.try_get::<String, _>("instance_id")?),
        failed_sequence: from_db(row.try_get("failed_sequence")?),
        failure_count: u32::try_from(failure_count).unwrap_or_default(),
        error_message: row.try_get("error_message")?,
        last_failed: row.try_get("last_failed")?,
    })
}

pub(crate) fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> ProjectionError {
    move |e| ProjectionError::Storage(format!("Failed to {context}: {e}"))
}
