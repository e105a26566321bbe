// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use covenant_core::clock::Clock;
use covenant_core::command::DEFAULT_COMMAND_RETRIES;
use covenant_core::{BoundedCommandQueue, Command, StatefulEntity};
use tracing::debug;

use super::PolicyMonitorCommand;
use crate::transfer::{TransferListener, TransferProcess};

/// Requests a [`PolicyMonitorEntry`](super::PolicyMonitorEntry) for every
/// transfer that starts.
///
/// Listeners run synchronously, so the entry is not saved here. A start
/// command is queued for the policy monitor manager, which creates the entry
/// with the usual command retries.
pub struct StartMonitoring {
    queue: Arc<BoundedCommandQueue<PolicyMonitorCommand>>,
    clock: Arc<dyn Clock>,
    command_retries: u32,
}

impl StartMonitoring {
    pub fn new(queue: Arc<BoundedCommandQueue<PolicyMonitorCommand>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            clock,
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }

    /// Retries granted to the start command.
    pub fn with_command_retries(mut self, command_retries: u32) -> Self {
        self.command_retries = command_retries;
        self
    }
}

impl TransferListener for StartMonitoring {
    fn started(&self, transfer: &TransferProcess) -> anyhow::Result<()> {
        let command = Command::new(
            transfer.id(),
            PolicyMonitorCommand::Start {
                contract_id: transfer.contract_id.clone(),
                policy: transfer.policy.clone(),
            },
            self.clock.now_millis(),
        )
        .with_retries(self.command_retries);
        self.queue.try_enqueue(command)?;
        debug!(transfer_id = %transfer.id(), "Policy monitoring requested");
        Ok(())
    }
}
