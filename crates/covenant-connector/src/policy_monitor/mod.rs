// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Policy monitor: re-evaluates the policy of every running transfer.
//!
//! An entry is created when a transfer starts and shares the transfer's ID.
//! The transfer listener queues a start command; the manager's command drain
//! creates the entry and retries it if the store is unavailable.
//! While the transfer runs, the entry stays in STARTED and is re-checked
//! every interval without consuming retries. A violated policy terminates
//! the transfer through its command queue.
//!
//! ```text
//! STARTED ─► COMPLETED
//!    └─────► FAILED
//! ```

mod commands;
mod handlers;
mod listener;

use covenant_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

pub use commands::{CreateMonitorEntry, PolicyMonitorCommand};
pub use handlers::{CheckPolicy, manager_builder};
pub use listener::StartMonitoring;

/// States of a [`PolicyMonitorEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyMonitorState {
    Started,
    Completed,
    Failed,
}

impl EntityState for PolicyMonitorState {
    const ALL: &'static [Self] = &[Self::Started, Self::Completed, Self::Failed];
    const INITIAL: Self = Self::Started;

    fn code(self) -> i32 {
        match self {
            Self::Started => 100,
            Self::Completed => 200,
            Self::Failed => 300,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Started => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    fn failure_state(self) -> Self {
        Self::Failed
    }
}

/// Monitoring record for one running transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMonitorEntry {
    /// Bookkeeping. The ID is the transfer's ID.
    pub meta: EntityMeta<PolicyMonitorState>,
    /// Agreement the transfer runs under.
    pub contract_id: String,
    /// Participant whose usage is evaluated.
    pub participant_id: String,
    /// Policy to enforce.
    pub policy: Policy,
}

impl PolicyMonitorEntry {
    /// An entry in [`PolicyMonitorState::Started`].
    pub fn new(
        transfer_id: impl Into<String>,
        contract_id: impl Into<String>,
        participant_id: impl Into<String>,
        policy: Policy,
        now_millis: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(transfer_id, now_millis),
            contract_id: contract_id.into(),
            participant_id: participant_id.into(),
            policy,
        }
    }
}

impl StatefulEntity for PolicyMonitorEntry {
    type State = PolicyMonitorState;
    const ENTITY_TYPE: &'static str = "policy_monitor";

    fn meta(&self) -> &EntityMeta<PolicyMonitorState> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta<PolicyMonitorState> {
        &mut self.meta
    }
}
