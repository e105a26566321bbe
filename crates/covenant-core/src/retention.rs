// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deleting old terminal entities.
//!
//! Entities in a terminal state whose `state_timestamp` is older than the
//! configured retention period are deleted in batches. Managers never delete
//! entities themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::clock::{self, Clock};
use crate::config::{ConfigError, parse_var};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{StoreError, StoreResult};
use crate::store::{EntityFilter, EntityStore};

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Whether retention is enabled.
    pub enabled: bool,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Minimum age of a terminal entity before it is deleted.
    pub max_age: Duration,
    /// Entities fetched per query.
    pub batch_size: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
            batch_size: 100,
        }
    }
}

impl RetentionConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COVENANT_RETENTION_ENABLED`: "true"/"1" or "false"/"0" (default: false)
    /// - `COVENANT_RETENTION_POLL_INTERVAL_SECS`: seconds between sweeps (default: 3600)
    /// - `COVENANT_RETENTION_MAX_AGE_DAYS`: days before terminal entities are deleted (default: 30)
    /// - `COVENANT_RETENTION_BATCH_SIZE`: entities per batch (default: 100)
    ///
    /// A malformed value is an error, as in [`Config::from_env`](crate::config::Config::from_env).
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = match std::env::var("COVENANT_RETENTION_ENABLED") {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "COVENANT_RETENTION_ENABLED",
                        "must be true, false, 1 or 0",
                    ));
                }
            },
            Err(_) => false,
        };

        let poll_interval_secs: u64 = parse_var(
            "COVENANT_RETENTION_POLL_INTERVAL_SECS",
            3600,
            "must be a number of seconds",
        )?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "COVENANT_RETENTION_POLL_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        let max_age_days: u64 = parse_var(
            "COVENANT_RETENTION_MAX_AGE_DAYS",
            30,
            "must be a number of days",
        )?;

        let batch_size: i64 = parse_var(
            "COVENANT_RETENTION_BATCH_SIZE",
            100,
            "must be a positive integer",
        )?;
        if batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "COVENANT_RETENTION_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days.saturating_mul(24 * 3600)),
            batch_size,
        })
    }
}

/// Periodically deletes old terminal entities of type `E`.
pub struct RetentionWorker<E: StatefulEntity> {
    store: Arc<dyn EntityStore<E>>,
    config: RetentionConfig,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
}

impl<E: StatefulEntity> RetentionWorker<E> {
    /// Create a worker.
    pub fn new(store: Arc<dyn EntityStore<E>>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            clock: clock::system(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Use a specific clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle used to stop the worker with `notify_one()`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run sweeps until shut down. Returns immediately when disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!(entity_type = E::ENTITY_TYPE, "Retention worker disabled");
            return;
        }

        info!(
            entity_type = E::ENTITY_TYPE,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(entity_type = E::ENTITY_TYPE, "Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(entity_type = E::ENTITY_TYPE, error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        info!(entity_type = E::ENTITY_TYPE, "Retention worker stopped");
    }

    /// Delete every terminal entity older than the retention period.
    /// Returns the number of deleted entities.
    pub async fn sweep(&self) -> StoreResult<u64> {
        let cutoff = self.clock.now_millis() - self.config.max_age.as_millis() as i64;
        let batch_size = self.config.batch_size.max(1);
        let mut total_deleted = 0u64;

        for state in E::State::ALL.iter().copied().filter(|s| s.is_terminal()) {
            loop {
                let filter = EntityFilter {
                    state: Some(state),
                    state_timestamp_before: Some(cutoff),
                    limit: batch_size,
                    offset: 0,
                };
                let batch = self.store.query(&filter).await?;
                if batch.is_empty() {
                    break;
                }

                let fetched = batch.len();
                for entity in batch {
                    match self.store.delete(entity.id()).await {
                        Ok(()) => total_deleted += 1,
                        Err(StoreError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }

                debug!(
                    entity_type = E::ENTITY_TYPE,
                    state = state.name(),
                    batch_size = fetched,
                    total_deleted,
                    "Deleted batch of terminal entities"
                );

                if (fetched as i64) < batch_size {
                    break;
                }
            }
        }

        if total_deleted > 0 {
            info!(
                entity_type = E::ENTITY_TYPE,
                total_deleted, cutoff, "Retention sweep completed"
            );
        } else {
            debug!(entity_type = E::ENTITY_TYPE, "Retention sweep completed, nothing to delete");
        }

        Ok(total_deleted)
    }
}
