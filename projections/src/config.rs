//! Spooler and handler configuration.
//!
//! Both structs have sensible defaults, builder setters, a `validate()` step
//! and `from_env()` which overlays `WARDEN_*` environment variables on the
//! defaults.
//!
//! | variable | field |
//! |----------|-------|
//! | `WARDEN_SPOOLER_WORKERS` | [`SpoolerConfig::workers`] |
//! | `WARDEN_SPOOLER_ID` | [`SpoolerConfig::spooler_id`] |
//! | `WARDEN_PROJECTION_QUERY_LIMIT` | [`HandlerConfig::query_limit`] |
//! | `WARDEN_PROJECTION_MIN_CYCLE_MS` | [`HandlerConfig::minimum_cycle_duration_ms`] |
//! | `WARDEN_PROJECTION_LOCK_MS` | [`HandlerConfig::lock_duration_ms`] |
//! | `WARDEN_PROJECTION_CONCURRENT_INSTANCES` | [`HandlerConfig::concurrent_instances`] |
//! | `WARDEN_PROJECTION_MAX_FAILURES` | [`HandlerConfig::error_count_until_skip`] |
//! | `WARDEN_PROJECTION_RETRY_MS` | [`HandlerConfig::retry_failed_after_ms`] |
//! | `WARDEN_PROJECTION_BULK_LIMIT` | [`HandlerConfig::bulk_limit`] |
//!
//! # Example
//!
//! ```
//! use warden_projections::config::{HandlerConfig, SpoolerConfig};
//!
//! let config = SpoolerConfig::default()
//!     .with_workers(4)
//!     .with_handler(HandlerConfig::default().with_query_limit(500));
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Per-handler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Maximum events fetched per query.
    pub query_limit: usize,
    /// Minimum time between two scheduled runs of a handler.
    pub minimum_cycle_duration_ms: u64,
    /// TTL of the view lock; renewed every third of it.
    pub lock_duration_ms: u64,
    /// Instances processed per query.
    pub concurrent_instances: usize,
    /// Failures after which a poison event is skipped.
    pub error_count_until_skip: u32,
    /// Backoff before a failed chunk is re-queried.
    pub retry_failed_after_ms: u64,
    /// Maximum events a catch-up burst may reduce.
    pub bulk_limit: usize,
}

impl HandlerConfig {
    /// Load defaults overlaid with `WARDEN_PROJECTION_*` variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_value("WARDEN_PROJECTION_QUERY_LIMIT")? {
            config.query_limit = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_MIN_CYCLE_MS")? {
            config.minimum_cycle_duration_ms = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_LOCK_MS")? {
            config.lock_duration_ms = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_CONCURRENT_INSTANCES")? {
            config.concurrent_instances = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_MAX_FAILURES")? {
            config.error_count_until_skip = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_RETRY_MS")? {
            config.retry_failed_after_ms = v;
        }
        if let Some(v) = env_value("WARDEN_PROJECTION_BULK_LIMIT")? {
            config.bulk_limit = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate handler configuration
    ///
    /// # Errors
    ///
    /// Returns error if a limit or duration is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_limit == 0 {
            return Err(ConfigError::ValidationError("query_limit must be > 0".to_string()));
        }
        if self.lock_duration_ms == 0 {
            return Err(ConfigError::ValidationError("lock_duration_ms must be > 0".to_string()));
        }
        if self.concurrent_instances == 0 {
            return Err(ConfigError::ValidationError(
                "concurrent_instances must be > 0".to_string(),
            ));
        }
        if self.error_count_until_skip == 0 {
            return Err(ConfigError::ValidationError(
                "error_count_until_skip must be > 0".to_string(),
            ));
        }
        if self.bulk_limit == 0 {
            return Err(ConfigError::ValidationError("bulk_limit must be > 0".to_string()));
        }
        Ok(())
    }

    /// Set the query limit
    #[must_use]
    pub const fn with_query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit;
        self
    }

    /// Set the minimum cycle duration
    #[must_use]
    pub const fn with_minimum_cycle_duration(mut self, duration: Duration) -> Self {
        self.minimum_cycle_duration_ms = millis(duration);
        self
    }

    /// Set the lock duration
    #[must_use]
    pub const fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration_ms = millis(duration);
        self
    }

    /// Set the number of instances per query
    #[must_use]
    pub const fn with_concurrent_instances(mut self, instances: usize) -> Self {
        self.concurrent_instances = instances;
        self
    }

    /// Set the failure count after which an event is skipped
    #[must_use]
    pub const fn with_error_count_until_skip(mut self, count: u32) -> Self {
        self.error_count_until_skip = count;
        self
    }

    /// Set the retry backoff
    #[must_use]
    pub const fn with_retry_failed_after(mut self, duration: Duration) -> Self {
        self.retry_failed_after_ms = millis(duration);
        self
    }

    /// Set the catch-up bulk limit
    #[must_use]
    pub const fn with_bulk_limit(mut self, limit: usize) -> Self {
        self.bulk_limit = limit;
        self
    }

    /// Minimum cycle duration as `Duration`
    #[must_use]
    pub const fn minimum_cycle_duration(&self) -> Duration {
        Duration::from_millis(self.minimum_cycle_duration_ms)
    }

    /// Lock duration as `Duration`
    #[must_use]
    pub const fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Retry backoff as `Duration`
    #[must_use]
    pub const fn retry_failed_after(&self) -> Duration {
        Duration::from_millis(self.retry_failed_after_ms)
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            query_limit: 200,
            minimum_cycle_duration_ms: 1_000,
            lock_duration_ms: 30_000,
            concurrent_instances: 1,
            error_count_until_skip: 5,
            retry_failed_after_ms: 1_000,
            bulk_limit: 200,
        }
    }
}

/// Spooler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolerConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Identifier of this process in the lock table; generated if unset.
    pub spooler_id: Option<String>,
    /// Defaults for handlers built from this configuration.
    pub handler: HandlerConfig,
}

impl SpoolerConfig {
    /// Load defaults overlaid with `WARDEN_SPOOLER_*` and
    /// `WARDEN_PROJECTION_*` variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            handler: HandlerConfig::from_env()?,
            ..Self::default()
        };
        if let Some(v) = env_value("WARDEN_SPOOLER_WORKERS")? {
            config.workers = v;
        }
        if let Ok(id) = std::env::var("WARDEN_SPOOLER_ID") {
            config.spooler_id = Some(id);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate spooler configuration
    ///
    /// # Errors
    ///
    /// Returns error if there are no workers or the handler defaults are invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationError("workers must be > 0".to_string()));
        }
        if self.spooler_id.as_deref() == Some("") {
            return Err(ConfigError::ValidationError("spooler_id cannot be empty".to_string()));
        }
        self.handler.validate()
    }

    /// Set the number of workers
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the spooler id used as lock owner prefix
    #[must_use]
    pub fn with_spooler_id(mut self, id: impl Into<String>) -> Self {
        self.spooler_id = Some(id.into());
        self
    }

    /// Set the handler defaults
    #[must_use]
    pub fn with_handler(mut self, handler: HandlerConfig) -> Self {
        self.handler = handler;
        self
    }
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            spooler_id: None,
            handler: HandlerConfig::default(),
        }
    }
}

fn env_value<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[allow(clippy::cast_possible_truncation)] // durations in config are far below u64::MAX ms
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
