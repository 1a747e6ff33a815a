//! Connection pool configuration.

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Errors raised while configuring or preparing the database.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pool could not connect
    #[error("Failed to connect: {0}")]
    Connection(#[from] sqlx::Error),

    /// Migrations failed
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pool settings.
///
/// `from_env` reads `DATABASE_URL` (required) and the optional
/// `WARDEN_DB_MAX_CONNECTIONS` / `WARDEN_DB_ACQUIRE_TIMEOUT_SECS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Seconds to wait for a free connection.
    pub acquire_timeout_secs: u64,
}

impl PostgresConfig {
    /// Configuration for `database_url` with default pool settings.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Load from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Config`] if `DATABASE_URL` is unset or a
    /// numeric variable does not parse.
    pub fn from_env() -> Result<Self, PostgresError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| PostgresError::Config("DATABASE_URL not set".to_string()))?;
        let mut config = Self::new(database_url);

        if let Ok(value) = std::env::var("WARDEN_DB_MAX_CONNECTIONS") {
            config.max_connections = value.parse().map_err(|_| {
                PostgresError::Config(format!("Invalid WARDEN_DB_MAX_CONNECTIONS: {value}"))
            })?;
        }
        if let Ok(value) = std::env::var("WARDEN_DB_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout_secs = value.parse().map_err(|_| {
                PostgresError::Config(format!("Invalid WARDEN_DB_ACQUIRE_TIMEOUT_SECS: {value}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate pool settings
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Config`] for an empty URL or a zero pool size.
    pub fn validate(&self) -> Result<(), PostgresError> {
        if self.database_url.is_empty() {
            return Err(PostgresError::Config("database_url cannot be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(PostgresError::Config("max_connections must be > 0".to_string()));
        }
        Ok(())
    }

    /// Set the maximum pool size
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Get the acquire timeout as Duration
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError`] if the configuration is invalid or the
    /// database is unreachable.
    pub async fn connect(&self) -> Result<PgPool, PostgresError> {
        self.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout())
            .connect(&self.database_url)
            .await?;
        tracing::info!(max_connections = self.max_connections, "Connected to Postgres");
        Ok(pool)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_is_invalid() {
        assert!(matches!(
            PostgresConfig::default().validate(),
            Err(PostgresError::Config(_))
        ));
        assert!(PostgresConfig::new("postgres://localhost/warden").validate().is_ok());
        assert!(
            PostgresConfig::new("postgres://localhost/warden")
                .with_max_connections(0)
                .validate()
                .is_err()
        );
    }
}
