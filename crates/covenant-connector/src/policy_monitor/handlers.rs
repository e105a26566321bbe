// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The policy check run for monitored transfers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use covenant_core::clock::Clock;
use covenant_core::command::DEFAULT_COMMAND_RETRIES;
use covenant_core::manager::StateMachineManagerBuilder;
use covenant_core::{
    Command, CommandQueue, EntityStore, Outcome, StateHandler, StateMachineManager, StatefulEntity,
};
use tracing::{debug, info};

use super::{PolicyMonitorEntry, PolicyMonitorState};
use crate::policy::{PolicyContext, PolicyEngine};
use crate::transfer::{TransferCommand, TransferProcess};

/// STARTED: evaluate the policy and terminate the transfer once it no longer holds.
pub struct CheckPolicy {
    transfers: Arc<dyn EntityStore<TransferProcess>>,
    transfer_commands: Arc<dyn CommandQueue<TransferCommand>>,
    engine: Arc<dyn PolicyEngine>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    command_retries: u32,
}

impl CheckPolicy {
    pub fn new(
        transfers: Arc<dyn EntityStore<TransferProcess>>,
        transfer_commands: Arc<dyn CommandQueue<TransferCommand>>,
        engine: Arc<dyn PolicyEngine>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            transfers,
            transfer_commands,
            engine,
            clock,
            interval,
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }

    /// Retries granted to the termination command.
    pub fn with_command_retries(mut self, command_retries: u32) -> Self {
        self.command_retries = command_retries;
        self
    }
}

#[async_trait]
impl StateHandler<PolicyMonitorEntry> for CheckPolicy {
    async fn handle(&self, entry: &mut PolicyMonitorEntry) -> Outcome<PolicyMonitorState> {
        let transfer = match self.transfers.find(entry.id()).await {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Outcome::fatal(format!("transfer '{}' not found", entry.id())),
            Err(e) => return Outcome::retry(e.to_string()),
        };

        if transfer.state().is_ending() {
            debug!(transfer_id = %entry.id(), "Transfer ended, monitoring complete");
            return Outcome::Proceed(PolicyMonitorState::Completed);
        }

        let context = PolicyContext {
            participant_id: entry.participant_id.clone(),
            now_millis: self.clock.now_millis(),
        };
        let Err(violation) = self.engine.evaluate(&entry.policy, &context) else {
            return Outcome::Pending(self.interval);
        };

        info!(
            transfer_id = %entry.id(),
            contract_id = %entry.contract_id,
            violation = %violation,
            "Policy no longer valid, terminating transfer"
        );
        let command = Command::new(
            entry.id(),
            TransferCommand::Terminate {
                reason: violation.to_string(),
            },
            self.clock.now_millis(),
        )
        .with_retries(self.command_retries);

        match self.transfer_commands.enqueue(command).await {
            Ok(()) => Outcome::Proceed(PolicyMonitorState::Completed),
            Err(e) => Outcome::retry(e.to_string()),
        }
    }
}

/// Manager builder with the policy monitor transition table installed.
pub fn manager_builder(
    store: Arc<dyn EntityStore<PolicyMonitorEntry>>,
    check: CheckPolicy,
) -> StateMachineManagerBuilder<PolicyMonitorEntry> {
    StateMachineManager::builder("policy-monitor", store).on_state(PolicyMonitorState::Started, check)
}
