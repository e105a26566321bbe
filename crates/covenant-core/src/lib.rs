// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Covenant Core - Stateful Process Orchestration Engine
//!
//! This crate drives long-running, crash-tolerant business processes
//! (contract negotiations, transfers, policy monitors) through their
//! lifecycle. Several runtime instances may poll the same store; the store's
//! lease-and-claim operation is the only synchronization point.
//!
//! # Architecture
//!
//! ```text
//!      external callers                          remote parties
//!  (API, inbound messages)                             ▲
//!            │ enqueue                                 │ dispatch
//!            ▼                                         │
//! ┌──────────────────────┐   drain   ┌──────────────────────────────┐
//! │    CommandQueue      │──────────►│     StateMachineManager      │
//! │  (bounded, FIFO)     │           │  state -> handler table      │
//! └──────────────────────┘           │  claim, handle, save, notify │
//!                                    └──────────────────────────────┘
//!                                        │ next_for_state  │ on_transition
//!                                        ▼ save/reschedule ▼
//!                            ┌──────────────────┐  ┌──────────────────┐
//!                            │   EntityStore    │  │    Observable    │
//!                            │ memory / SQLite  │  │    listeners,    │
//!                            │   / PostgreSQL   │  │  EventPublisher  │
//!                            └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | At most one active processor per entity | Lease stamped by `next_for_state` |
//! | No starvation | Claims ordered by oldest `state_timestamp` |
//! | Crash recovery | Expired leases become reclaimable |
//! | Lost-update protection | Version check on `save` |
//! | Bounded retries | `state_count` vs. [`retry::RetryPolicy`] |
//!
//! # Error Taxonomy
//!
//! | Kind | Representation |
//! |------|----------------|
//! | Transient retry | [`manager::Outcome::Retry`] |
//! | Terminal business failure | Failure state with `error_detail` |
//! | Concurrency conflict | [`error::StoreError::ConcurrentModification`], discarded by the manager |
//! | Defect in a transition table | [`error::ManagerError::IllegalTransition`], stops the manager |
//! | Command exhaustion | Error-level log, command dropped |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the `COVENANT_*` environment variables.

#![deny(missing_docs)]

/// Time source.
pub mod clock;

/// Commands, command queue, runner and processor.
pub mod command;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Entity and state model.
pub mod entity;

/// Error types.
pub mod error;

/// State machine manager.
pub mod manager;

/// Embedded database migrations.
pub mod migrations;

/// Listener registry and transition events.
pub mod observe;

/// Retention worker for terminal entities.
pub mod retention;

/// Wait strategies and retry policy.
pub mod retry;

/// Entity store contract and backends.
pub mod store;

pub use command::{
    BoundedCommandQueue, Command, CommandDrain, CommandEffect, CommandHandler, CommandKind,
    CommandProcessor, CommandQueue, CommandRunner, EntityCommandRunner,
};
pub use entity::{EntityMeta, EntityState, StatefulEntity};
pub use error::{CommandError, IllegalTransition, ManagerError, StoreError, StoreResult};
pub use manager::{ManagerHandle, Outcome, StateHandler, StateMachineManager};
pub use observe::{EntityListener, EntityListeners, EventPublisher, Observable, TransitionEvent};
pub use store::{EntityFilter, EntityStore, StoreOptions};
