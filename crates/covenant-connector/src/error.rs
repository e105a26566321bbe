// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for covenant-connector.

use covenant_core::config::ConfigError;
use covenant_core::{CommandError, ManagerError, StoreError};
use thiserror::Error;

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connector's public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An entity store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A command could not be queued or applied.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A state machine manager stopped with an error.
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// A request was rejected before reaching a state machine.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Stable error code for API responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Store(e) => e.error_code(),
            Self::Command(CommandError::EntityNotFound { .. }) => "ENTITY_NOT_FOUND",
            Self::Command(CommandError::QueueFull { .. }) => "QUEUE_FULL",
            Self::Command(_) => "COMMAND_ERROR",
            Self::Manager(_) => "MANAGER_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}
