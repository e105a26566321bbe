// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use covenant_core::{EntityListener, StatefulEntity};

use super::{TransferProcess, TransferState};

/// Callbacks for transfer milestones. Every method defaults to a no-op.
pub trait TransferListener: Send + Sync {
    /// Resources are provisioned.
    fn provisioned(&self, _transfer: &TransferProcess) -> anyhow::Result<()> {
        Ok(())
    }

    /// The transfer request was delivered.
    fn requested(&self, _transfer: &TransferProcess) -> anyhow::Result<()> {
        Ok(())
    }

    /// The provider started the transfer.
    fn started(&self, _transfer: &TransferProcess) -> anyhow::Result<()> {
        Ok(())
    }

    /// The transfer completed.
    fn completed(&self, _transfer: &TransferProcess) -> anyhow::Result<()> {
        Ok(())
    }

    /// The transfer was aborted.
    fn terminated(&self, _transfer: &TransferProcess) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registers a [`TransferListener`] as an [`EntityListener`].
pub struct TransferListenerAdapter<L>(pub L);

impl<L: TransferListener> EntityListener<TransferProcess> for TransferListenerAdapter<L> {
    fn on_transition(&self, transfer: &TransferProcess, _previous: TransferState) -> anyhow::Result<()> {
        match transfer.state() {
            TransferState::Provisioned => self.0.provisioned(transfer),
            TransferState::Requested => self.0.requested(transfer),
            TransferState::Started => self.0.started(transfer),
            TransferState::Completed => self.0.completed(transfer),
            TransferState::Terminated => self.0.terminated(transfer),
            _ => Ok(()),
        }
    }
}
