// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::retention::RetentionConfig;
use crate::retry::{ExponentialWaitStrategy, RetryPolicy, WaitStrategy};
use crate::store::StoreOptions;

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/covenant.db";

/// Upper bound of the per-entity retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Covenant engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// `sqlite:` or `postgres://` URL, or `memory` for in-memory stores
    pub database_url: String,
    /// Lease owner identifier of this runtime instance
    pub runtime_id: String,
    /// Entities claimed per state per tick
    pub batch_size: usize,
    /// First idle wait of a manager
    pub iteration_wait: Duration,
    /// Longest idle wait of a manager
    pub iteration_wait_max: Duration,
    /// Retries allowed per state before an entity fails
    pub retry_limit: u32,
    /// First delay between retries of an entity
    pub retry_backoff_base: Duration,
    /// How long a claim stays exclusive
    pub lease_duration: Duration,
    /// Retries granted to out-of-band commands
    pub command_retries: u32,
    /// Retention worker settings
    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            batch_size: 5,
            iteration_wait: Duration::from_millis(1000),
            iteration_wait_max: Duration::from_millis(10_000),
            retry_limit: 7,
            retry_backoff_base: Duration::from_millis(1000),
            lease_duration: Duration::from_millis(60_000),
            command_retries: 5,
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `COVENANT_DATABASE_URL`: database URL (default: `sqlite:.data/covenant.db`)
    /// - `COVENANT_RUNTIME_ID`: lease owner id (default: random UUID)
    /// - `COVENANT_BATCH_SIZE`: entities per state per tick (default: 5)
    /// - `COVENANT_ITERATION_WAIT_MS`: first idle wait (default: 1000)
    /// - `COVENANT_ITERATION_WAIT_MAX_MS`: longest idle wait (default: 10000)
    /// - `COVENANT_RETRY_LIMIT`: retries per state (default: 7)
    /// - `COVENANT_RETRY_BACKOFF_BASE_MS`: first retry delay (default: 1000)
    /// - `COVENANT_LEASE_DURATION_MS`: lease TTL (default: 60000)
    /// - `COVENANT_COMMAND_RETRIES`: command retries (default: 5)
    /// - `COVENANT_RETENTION_*`: see [`RetentionConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("COVENANT_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        StoreBackend::parse(&database_url)?;

        let runtime_id = std::env::var("COVENANT_RUNTIME_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.runtime_id);

        let batch_size: usize =
            parse_var("COVENANT_BATCH_SIZE", 5, "must be a positive integer")?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid(
                "COVENANT_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let iteration_wait_ms: u64 =
            parse_var("COVENANT_ITERATION_WAIT_MS", 1000, "must be a number of milliseconds")?;
        let iteration_wait_max_ms: u64 = parse_var(
            "COVENANT_ITERATION_WAIT_MAX_MS",
            10_000,
            "must be a number of milliseconds",
        )?;
        if iteration_wait_max_ms < iteration_wait_ms {
            return Err(ConfigError::Invalid(
                "COVENANT_ITERATION_WAIT_MAX_MS",
                "must not be smaller than COVENANT_ITERATION_WAIT_MS",
            ));
        }

        let retry_limit: u32 =
            parse_var("COVENANT_RETRY_LIMIT", 7, "must be a non-negative integer")?;
        let retry_backoff_base_ms: u64 = parse_var(
            "COVENANT_RETRY_BACKOFF_BASE_MS",
            1000,
            "must be a number of milliseconds",
        )?;
        let lease_duration_ms: u64 = parse_var(
            "COVENANT_LEASE_DURATION_MS",
            60_000,
            "must be a number of milliseconds",
        )?;
        if lease_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "COVENANT_LEASE_DURATION_MS",
                "must be greater than zero",
            ));
        }
        let command_retries: u32 =
            parse_var("COVENANT_COMMAND_RETRIES", 5, "must be a non-negative integer")?;

        Ok(Self {
            database_url,
            runtime_id,
            batch_size,
            iteration_wait: Duration::from_millis(iteration_wait_ms),
            iteration_wait_max: Duration::from_millis(iteration_wait_max_ms),
            retry_limit,
            retry_backoff_base: Duration::from_millis(retry_backoff_base_ms),
            lease_duration: Duration::from_millis(lease_duration_ms),
            command_retries,
            retention: RetentionConfig::from_env()?,
        })
    }

    /// The store backend selected by `database_url`.
    pub fn store_backend(&self) -> Result<StoreBackend, ConfigError> {
        StoreBackend::parse(&self.database_url)
    }

    /// Idle backoff for managers.
    pub fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        Arc::new(ExponentialWaitStrategy::new(
            self.iteration_wait,
            self.iteration_wait_max,
        ))
    }

    /// Per-entity retry policy for managers.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_limit,
            Arc::new(ExponentialWaitStrategy::new(
                self.retry_backoff_base,
                MAX_RETRY_BACKOFF,
            )),
        )
    }

    /// Store settings for this runtime instance.
    pub fn store_options(&self, clock: Arc<dyn Clock>) -> StoreOptions {
        StoreOptions::default()
            .with_owner(self.runtime_id.clone())
            .with_lease_duration(self.lease_duration)
            .with_clock(clock)
    }
}

/// Where entities are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local maps; nothing survives a restart.
    Memory,
    /// SQLite database file.
    Sqlite(PathBuf),
    /// PostgreSQL connection URL.
    Postgres(String),
}

impl StoreBackend {
    /// Parse a database URL.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url == "memory" {
            return Ok(Self::Memory);
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres(url.to_string()));
        }
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            let path = rest.split('?').next().unwrap_or_default();
            if path.is_empty() {
                return Err(ConfigError::Invalid(
                    "COVENANT_DATABASE_URL",
                    "sqlite URL must name a file",
                ));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        Err(ConfigError::Invalid(
            "COVENANT_DATABASE_URL",
            "must be `memory`, a sqlite: URL or a postgres:// URL",
        ))
    }
}

pub(crate) fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
