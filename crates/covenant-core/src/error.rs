// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for covenant-core.
//!
//! Business outcomes (retry, terminal failure) are never errors; they are
//! expressed as handler outcomes and entity states. The types here cover
//! infrastructure failures, concurrency conflicts and programming errors.

use thiserror::Error;

/// Result type for entity store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`EntityStore`](crate::store::EntityStore) implementations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The entity does not exist.
    #[error("{entity_type} '{id}' not found")]
    NotFound {
        /// Entity type name.
        entity_type: &'static str,
        /// Entity ID.
        id: String,
    },

    /// The persisted version differs from the version carried by the caller's copy.
    #[error(
        "{entity_type} '{id}' was modified concurrently: expected version {expected}, found {actual}"
    )]
    ConcurrentModification {
        /// Entity type name.
        entity_type: &'static str,
        /// Entity ID.
        id: String,
        /// Version carried by the caller's copy.
        expected: u64,
        /// Version currently persisted.
        actual: u64,
    },

    /// The persisted entity is in a terminal state and can no longer be updated.
    #[error("{entity_type} '{id}' is in terminal state {state} and cannot be modified")]
    TerminalState {
        /// Entity type name.
        entity_type: &'static str,
        /// Entity ID.
        id: String,
        /// Name of the terminal state.
        state: &'static str,
    },

    /// Deletion was requested for an entity that has not reached a terminal state.
    #[error("{entity_type} '{id}' is in state {state} and cannot be deleted")]
    NotTerminal {
        /// Entity type name.
        entity_type: &'static str,
        /// Entity ID.
        id: String,
        /// Name of the current state.
        state: &'static str,
    },

    /// A persisted state code is not part of the entity's state enumeration.
    #[error("{entity_type} '{id}' has unknown state code {code}")]
    UnknownState {
        /// Entity type name.
        entity_type: &'static str,
        /// Entity ID.
        id: String,
        /// The offending code.
        code: i32,
    },

    /// Document (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ENTITY_NOT_FOUND",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::TerminalState { .. } => "TERMINAL_STATE",
            Self::NotTerminal { .. } => "NOT_TERMINAL",
            Self::UnknownState { .. } => "UNKNOWN_STATE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error means another actor already advanced the entity.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A handler or command requested a state change that is not an edge of the
/// process type's transition table. This is a defect, not a runtime condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition of {entity_type} '{id}' from {from} to {to}")]
pub struct IllegalTransition {
    /// Entity type name.
    pub entity_type: &'static str,
    /// Entity ID.
    pub id: String,
    /// Current state name.
    pub from: &'static str,
    /// Requested state name.
    pub to: &'static str,
}

/// Errors that stop a [`StateMachineManager`](crate::manager::StateMachineManager).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// A handler returned a target state outside the transition table.
    #[error("Manager '{manager}' aborted: {source}")]
    IllegalTransition {
        /// Manager name.
        manager: String,
        /// The offending transition.
        #[source]
        source: IllegalTransition,
    },

    /// The store failed during a tick.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The manager task panicked or was cancelled.
    #[error("Manager task failed: {0}")]
    Join(String),
}

/// Errors produced while running or queueing commands.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The command's target entity does not exist.
    #[error("Could not find {entity_type} with ID [{id}]")]
    EntityNotFound {
        /// Entity type name.
        entity_type: &'static str,
        /// Target entity ID.
        id: String,
    },

    /// The target entity is in a state the command cannot be applied to.
    #[error("Command {command} cannot be applied to {entity_type} '{id}' in state {state}")]
    InvalidState {
        /// Command tag.
        command: &'static str,
        /// Entity type name.
        entity_type: &'static str,
        /// Target entity ID.
        id: String,
        /// Current state name.
        state: &'static str,
    },

    /// The command handler requested an illegal transition.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// The command handler rejected the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The bounded command queue is full.
    #[error("Command queue is full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// Persisting the entity failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
