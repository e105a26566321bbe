// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use async_trait::async_trait;
use covenant_core::clock::Clock;
use covenant_core::{Command, CommandError, CommandKind, CommandRunner, EntityStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PolicyMonitorEntry;
use crate::policy::Policy;

/// Commands addressed to the policy monitor. The entity ID is the transfer's ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyMonitorCommand {
    /// Begin monitoring a transfer that just started.
    Start {
        /// Agreement the transfer runs under.
        contract_id: String,
        /// Policy to enforce.
        policy: Policy,
    },
}

impl CommandKind for PolicyMonitorCommand {
    fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start-monitoring",
        }
    }
}

/// Creates monitor entries. A store failure is returned so the processor
/// retries it; an entry that already exists counts as done.
pub struct CreateMonitorEntry {
    store: Arc<dyn EntityStore<PolicyMonitorEntry>>,
    participant_id: String,
    clock: Arc<dyn Clock>,
}

impl CreateMonitorEntry {
    pub fn new(
        store: Arc<dyn EntityStore<PolicyMonitorEntry>>,
        participant_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            participant_id: participant_id.into(),
            clock,
        }
    }
}

#[async_trait]
impl CommandRunner<PolicyMonitorCommand> for CreateMonitorEntry {
    async fn run(&self, command: &Command<PolicyMonitorCommand>) -> Result<(), CommandError> {
        let PolicyMonitorCommand::Start {
            contract_id,
            policy,
        } = &command.kind;
        let mut entry = PolicyMonitorEntry::new(
            command.entity_id.clone(),
            contract_id.clone(),
            self.participant_id.clone(),
            policy.clone(),
            self.clock.now_millis(),
        );

        match self.store.save(&mut entry).await {
            Ok(()) => {
                debug!(transfer_id = %command.entity_id, "Policy monitoring started");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(transfer_id = %command.entity_id, "Policy monitoring already running");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
