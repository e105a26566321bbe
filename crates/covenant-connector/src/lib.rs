// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Covenant Connector - Dataspace Connector Runtime
//!
//! Drives the three long-running processes of a dataspace connector on top
//! of `covenant-core`:
//!
//! - **Contract negotiation**: request an offer, receive and verify the
//!   agreement, finalize.
//! - **Transfer process**: provision resources, request the data, follow the
//!   provider until the transfer completes or terminates.
//! - **Policy monitor**: re-evaluate the agreed policy of every started
//!   transfer and terminate the transfer once the policy no longer holds.
//!
//! # Architecture
//!
//! ```text
//!   API caller / inbound protocol message
//!        │ initiate_*            │ *_command
//!        ▼                       ▼
//!  ┌───────────┐         ┌──────────────┐
//!  │  Stores   │◄────────│ CommandQueue │
//!  └───────────┘         └──────────────┘
//!        ▲                       │ drained each iteration
//!        │ claim / save          ▼
//!  ┌──────────────────────────────────────┐   dispatch   ┌────────────┐
//!  │ negotiation / transfer / monitor     │─────────────►│ Dispatcher │
//!  │ StateMachineManagers                 │              └────────────┘
//!  └──────────────────────────────────────┘
//!        │ transitions
//!        ▼
//!  listeners (StartMonitoring, EventPublisher, user listeners)
//! ```
//!
//! Transport, identity and catalog are out of scope: outbound messages go
//! through the [`dispatch::Dispatcher`] trait and inbound messages arrive as
//! commands.

/// Connector configuration.
pub mod config;

/// Outbound protocol messages.
pub mod dispatch;

/// Error types.
pub mod error;

/// Contract negotiation process.
pub mod negotiation;

/// Usage policies and their evaluation.
pub mod policy;

/// Policy monitor process.
pub mod policy_monitor;

/// Resource provisioning for transfers.
pub mod provision;

/// Connector runtime.
pub mod runtime;

/// Store wiring.
pub mod stores;

/// Transfer process.
pub mod transfer;

pub use config::ConnectorConfig;
pub use error::{Error, Result};
pub use runtime::{ConnectorRuntime, ConnectorRuntimeBuilder, NewTransfer};
pub use stores::Stores;
