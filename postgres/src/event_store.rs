//! `PostgreSQL` event log.
//!
//! # Push transaction
//!
//! 1. Take a transaction-scoped advisory lock per touched instance (sorted,
//!    so concurrent pushes cannot deadlock). This serializes commits of one
//!    instance, which keeps `sequence` gapless and commit-ordered.
//! 2. Check every `expected_sequence` against the aggregate's current
//!    aggregate sequence.
//! 3. Release `Remove` constraints, then claim `Add` constraints with
//!    `ON CONFLICT DO NOTHING`; zero affected rows is a violation.
//! 4. Insert the events and commit.
//!
//! Any error drops the transaction, which rolls everything back.

use crate::{from_db, to_db};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use warden_core::{
    Aggregate, AggregateId, AggregateType, Command, Editor, EventStore, EventType, EventstoreError,
    InstanceId, Order, QueryFilter, SearchQuery, StoredEvent, UniqueConstraintAction,
};

const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, aggregate_sequence, \
     aggregate_version, resource_owner, event_type, sequence, payload, editor_service, \
     editor_user, created_at";

type AggregateKey = (InstanceId, AggregateType, AggregateId);

/// `PostgreSQL` implementation of [`EventStore`].
///
/// # Example
///
/// ```ignore
/// use warden_postgres::PostgresEventStore;
///
/// let store = PostgresEventStore::from_pool(pool);
/// let eventstore = Eventstore::new(Arc::new(store), registry);
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create an event store over an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn append(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventstoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| internal("Failed to begin transaction", &e))?;

        let instances: BTreeSet<&InstanceId> =
            commands.iter().map(|c| &c.aggregate.instance_id).collect();
        for instance_id in &instances {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(instance_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| internal("Failed to lock instance", &e))?;
        }

        let mut aggregate_sequences: HashMap<AggregateKey, u64> = HashMap::new();
        for command in &commands {
            let key = aggregate_key(&command.aggregate);
            if !aggregate_sequences.contains_key(&key) {
                let current = current_aggregate_sequence(&mut tx, &key).await?;
                aggregate_sequences.insert(key.clone(), current);
            }
            if let Some(expected) = command.expected_sequence {
                let actual = aggregate_sequences.get(&key).copied().unwrap_or_default();
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
        }

        apply_unique_constraints(&mut tx, &commands).await?;

        let mut instance_sequences: HashMap<InstanceId, u64> = HashMap::new();
        for instance_id in instances {
            let (latest,): (i64,) = sqlx::query_as(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE instance_id = $1",
            )
            .bind(instance_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| internal("Failed to read instance sequence", &e))?;
            instance_sequences.insert(instance_id.clone(), from_db(latest));
        }

        let mut pushed = Vec::with_capacity(commands.len());
        for command in commands {
            let sequence = next(
                instance_sequences
                    .entry(command.aggregate.instance_id.clone())
                    .or_default(),
            );
            let aggregate_sequence = next(
                aggregate_sequences
                    .entry(aggregate_key(&command.aggregate))
                    .or_default(),
            );
            pushed.push(insert_event(&mut tx, command, sequence, aggregate_sequence).await?);
        }

        tx.commit()
            .await
            .map_err(|e| internal("Failed to commit events", &e))?;
        Ok(pushed)
    }

    async fn select(&self, query: &SearchQuery) -> Result<Vec<StoredEvent>, EventstoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
        push_conditions(&mut builder, query)?;
        builder.push(match query.order {
            Order::Ascending => " ORDER BY sequence, instance_id",
            Order::Descending => " ORDER BY sequence DESC, instance_id DESC",
        });
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("Failed to filter events", &e))?;
        rows.iter()
            .map(event_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| internal("Failed to decode event row", &e))
    }

    async fn max_sequence(&self, query: &SearchQuery) -> Result<u64, EventstoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT COALESCE(MAX(sequence), 0) FROM events");
        push_conditions(&mut builder, query)?;
        let (latest,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| internal("Failed to read latest sequence", &e))?;
        Ok(from_db(latest))
    }

    async fn instances(&self) -> Result<Vec<InstanceId>, EventstoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT instance_id FROM events ORDER BY instance_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| internal("Failed to list instances", &e))?;
        Ok(rows.into_iter().map(|(id,)| InstanceId::new(id)).collect())
    }
}

impl EventStore for PostgresEventStore {
    fn push(
        &self,
        commands: Vec<Command>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + '_>> {
        Box::pin(self.append(commands))
    }

    fn filter<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventstoreError>> + Send + 'a>> {
        Box::pin(self.select(query))
    }

    fn latest_sequence<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventstoreError>> + Send + 'a>> {
        Box::pin(self.max_sequence(query))
    }

    fn instance_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceId>, EventstoreError>> + Send + '_>> {
        Box::pin(self.instances())
    }
}

async fn current_aggregate_sequence(
    tx: &mut Transaction<'_, Postgres>,
    (instance_id, aggregate_type, aggregate_id): &AggregateKey,
) -> Result<u64, EventstoreError> {
    let (current,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(aggregate_sequence), 0) FROM events
         WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3",
    )
    .bind(instance_id.as_str())
    .bind(aggregate_type.as_str())
    .bind(aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| internal("Failed to read aggregate sequence", &e))?;
    Ok(from_db(current))
}

async fn apply_unique_constraints(
    tx: &mut Transaction<'_, Postgres>,
    commands: &[Command],
) -> Result<(), EventstoreError> {
    for (command, constraint) in constraints(commands, UniqueConstraintAction::Remove) {
        sqlx::query(
            "DELETE FROM unique_constraints
             WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3",
        )
        .bind(command.aggregate.instance_id.as_str())
        .bind(&constraint.unique_type)
        .bind(&constraint.field)
        .execute(&mut **tx)
        .await
        .map_err(|e| internal("Failed to release unique constraint", &e))?;
    }

    for (command, constraint) in constraints(commands, UniqueConstraintAction::Add) {
        let result = sqlx::query(
            "INSERT INTO unique_constraints (instance_id, unique_type, unique_field)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(command.aggregate.instance_id.as_str())
        .bind(&constraint.unique_type)
        .bind(&constraint.field)
        .execute(&mut **tx)
        .await
        .map_err(|e| internal("Failed to claim unique constraint", &e))?;

        if result.rows_affected() == 0 {
            return Err(EventstoreError::UniqueConstraintViolation {
                unique_type: constraint.unique_type.clone(),
                field: constraint.field.clone(),
                message: constraint.error_message.clone(),
            });
        }
    }
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    command: Command,
    sequence: u64,
    aggregate_sequence: u64,
) -> Result<StoredEvent, EventstoreError> {
    let aggregate = &command.aggregate;
    let (created_at,): (chrono::DateTime<chrono::Utc>,) = sqlx::query_as(
        "INSERT INTO events (instance_id, aggregate_type, aggregate_id, aggregate_sequence,
             aggregate_version, resource_owner, event_type, sequence, payload,
             editor_service, editor_user)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         RETURNING created_at",
    )
    .bind(aggregate.instance_id.as_str())
    .bind(aggregate.aggregate_type.as_str())
    .bind(aggregate.id.as_str())
    .bind(to_db(aggregate_sequence)?)
    .bind(aggregate.version.as_str())
    .bind(aggregate.resource_owner.as_str())
    .bind(command.event_type.as_str())
    .bind(to_db(sequence)?)
    .bind(&command.payload)
    .bind(&command.editor.service)
    .bind(&command.editor.user)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| internal("Failed to insert event", &e))?;

    Ok(StoredEvent {
        aggregate: command.aggregate,
        event_type: command.event_type,
        sequence,
        aggregate_sequence,
        payload: command.payload,
        created_at,
        editor: command.editor,
    })
}

fn push_conditions(
    builder: &mut QueryBuilder<'_, Postgres>,
    query: &SearchQuery,
) -> Result<(), EventstoreError> {
    if query.filters.is_empty() {
        return Ok(());
    }
    builder.push(" WHERE ");
    for (i, filter) in query.filters.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder.push("(TRUE");
        push_filter(builder, filter)?;
        builder.push(")");
    }
    Ok(())
}

fn push_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &QueryFilter,
) -> Result<(), EventstoreError> {
    if let Some(instance_id) = &filter.instance_id {
        builder.push(" AND instance_id = ").push_bind(instance_id.to_string());
    }
    if !filter.aggregate_types.is_empty() {
        let types: Vec<String> = filter.aggregate_types.iter().map(ToString::to_string).collect();
        builder.push(" AND aggregate_type = ANY(").push_bind(types).push(")");
    }
    if !filter.aggregate_ids.is_empty() {
        let ids: Vec<String> = filter.aggregate_ids.iter().map(ToString::to_string).collect();
        builder.push(" AND aggregate_id = ANY(").push_bind(ids).push(")");
    }
    if let Some(owner) = &filter.resource_owner {
        builder.push(" AND resource_owner = ").push_bind(owner.to_string());
    }
    if !filter.event_types.is_empty() {
        let types: Vec<String> = filter.event_types.iter().map(ToString::to_string).collect();
        builder.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
    if let Some(sequence) = filter.sequence_greater {
        builder.push(" AND sequence > ").push_bind(to_db(sequence)?);
    }
    if let Some(sequence) = filter.sequence_at_most {
        builder.push(" AND sequence <= ").push_bind(to_db(sequence)?);
    }
    Ok(())
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        aggregate: Aggregate::new(
            row.try_get::<String, _>("aggregate_type")?,
            row.try_get::<String, _>("aggregate_id")?,
            row.try_get::<String, _>("instance_id")?,
            row.try_get::<String, _>("resource_owner")?,
            row.try_get::<String, _>("aggregate_version")?,
        ),
        event_type: EventType::new(row.try_get::<String, _>("event_type")?),
        sequence: from_db(row.try_get("sequence")?),
        aggregate_sequence: from_db(row.try_get("aggregate_sequence")?),
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        editor: Editor::new(
            row.try_get::<String, _>("editor_service")?,
            row.try_get::<String, _>("editor_user")?,
        ),
    })
}

fn constraints(
    commands: &[Command],
    action: UniqueConstraintAction,
) -> impl Iterator<Item = (&Command, &warden_core::UniqueConstraint)> {
    commands.iter().flat_map(move |command| {
        command
            .unique_constraints
            .iter()
            .filter(move |c| c.action == action)
            .map(move |c| (command, c))
    })
}

fn aggregate_key(aggregate: &Aggregate) -> AggregateKey {
    (
        aggregate.instance_id.clone(),
        aggregate.aggregate_type.clone(),
        aggregate.id.clone(),
    )
}

fn next(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn internal(context: &str, error: &sqlx::Error) -> EventstoreError {
    tracing::error!(error = %error, "{context}");
    EventstoreError::Internal(format!("{context}: {error}"))
}
