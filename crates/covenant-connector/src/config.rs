// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector configuration.
//!
//! Engine settings come from [`covenant_core::config::Config`]; this adds the
//! settings owned by the connector's process types.

use std::time::Duration;

use covenant_core::config::{Config, ConfigError};

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Engine settings shared by every manager
    pub core: Config,
    /// Participant ID this connector acts as
    pub participant_id: String,
    /// Delay between two policy evaluations of a running transfer
    pub policy_check_interval: Duration,
    /// Capacity of each command queue
    pub command_queue_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            core: Config::default(),
            participant_id: "covenant-connector".to_string(),
            policy_check_interval: Duration::from_secs(10),
            command_queue_capacity: 1024,
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from environment variables.
    ///
    /// Besides the `COVENANT_*` engine variables read by
    /// [`Config::from_env`]:
    /// - `COVENANT_PARTICIPANT_ID`: participant ID (default: `covenant-connector`)
    /// - `COVENANT_POLICY_CHECK_INTERVAL_MS`: policy re-evaluation delay (default: 10000)
    /// - `COVENANT_COMMAND_QUEUE_CAPACITY`: commands held per queue (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = Config::from_env()?;

        let participant_id = std::env::var("COVENANT_PARTICIPANT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "covenant-connector".to_string());

        let policy_check_interval_ms = match std::env::var("COVENANT_POLICY_CHECK_INTERVAL_MS") {
            Ok(v) => v.trim().parse::<u64>().ok().filter(|ms| *ms > 0).ok_or(
                ConfigError::Invalid(
                    "COVENANT_POLICY_CHECK_INTERVAL_MS",
                    "must be a positive number of milliseconds",
                ),
            )?,
            Err(_) => 10_000,
        };

        let command_queue_capacity = match std::env::var("COVENANT_COMMAND_QUEUE_CAPACITY") {
            Ok(v) => v.trim().parse::<usize>().ok().filter(|n| *n > 0).ok_or(
                ConfigError::Invalid(
                    "COVENANT_COMMAND_QUEUE_CAPACITY",
                    "must be a positive integer",
                ),
            )?,
            Err(_) => 1024,
        };

        Ok(Self {
            core,
            participant_id,
            policy_check_interval: Duration::from_millis(policy_check_interval_ms),
            command_queue_capacity,
        })
    }
}
