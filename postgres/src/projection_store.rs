//! `PostgreSQL` key/value storage for read models.
//!
//! Simple read models serialize their rows and store them in the generic
//! `projection_data` table (or a table with the same shape). Views with
//! their own query needs create dedicated tables instead.

use crate::view_store::storage;
use sqlx::Row;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use warden_core::ProjectionStore;
use warden_core::projection::Result;

/// Default key/value table created by the migrations.
pub const DEFAULT_TABLE: &str = "projection_data";

/// Statements for one key/value table, rendered once per store.
#[derive(Debug)]
struct Statements {
    upsert: String,
    select: String,
    delete: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            upsert: format!(
                "INSERT INTO {table} (key, data) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data, updated_at = now()"
            ),
            select: format!("SELECT data FROM {table} WHERE key = $1"),
            delete: format!("DELETE FROM {table} WHERE key = $1"),
        }
    }
}

/// `PostgreSQL`-backed [`ProjectionStore`].
///
/// # Example
///
/// ```ignore
/// let users = UserProjection::new(PostgresProjectionStore::new(pool, DEFAULT_TABLE));
/// ```
#[derive(Clone, Debug)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    statements: Arc<Statements>,
}

impl PostgresProjectionStore {
    /// Create a store writing to `table_name`.
    ///
    /// The table name is interpolated into SQL; it must come from code, never from input.
    #[must_use]
    pub fn new(pool: PgPool, table_name: impl Into<String>) -> Self {
        let table_name: String = table_name.into();
        Self {
            pool,
            statements: Arc::new(Statements::for_table(&table_name)),
        }
    }
}

impl ProjectionStore for PostgresProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        sqlx::query(&self.statements.upsert)
            .bind(key)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(storage("save projection row"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        sqlx::query(&self.statements.select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("load projection row"))?
            .map(|row| row.try_get("data"))
            .transpose()
            .map_err(storage("decode projection row"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query(&self.statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage("delete projection row"))?;
        Ok(())
    }
}
