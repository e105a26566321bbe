// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use covenant_core::{EntityListener, StatefulEntity};

use super::{ContractNegotiation, NegotiationState};

/// Callbacks for negotiation milestones. Every method defaults to a no-op.
pub trait NegotiationListener: Send + Sync {
    /// The contract request was delivered.
    fn requested(&self, _negotiation: &ContractNegotiation) -> anyhow::Result<()> {
        Ok(())
    }

    /// The provider agreed.
    fn agreed(&self, _negotiation: &ContractNegotiation) -> anyhow::Result<()> {
        Ok(())
    }

    /// The agreement was verified.
    fn verified(&self, _negotiation: &ContractNegotiation) -> anyhow::Result<()> {
        Ok(())
    }

    /// The agreement is final and usable by transfers.
    fn finalized(&self, _negotiation: &ContractNegotiation) -> anyhow::Result<()> {
        Ok(())
    }

    /// The negotiation ended without an agreement.
    fn terminated(&self, _negotiation: &ContractNegotiation) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registers a [`NegotiationListener`] as an [`EntityListener`].
pub struct NegotiationListenerAdapter<L>(pub L);

impl<L: NegotiationListener> EntityListener<ContractNegotiation> for NegotiationListenerAdapter<L> {
    fn on_transition(
        &self,
        negotiation: &ContractNegotiation,
        _previous: NegotiationState,
    ) -> anyhow::Result<()> {
        match negotiation.state() {
            NegotiationState::Requested => self.0.requested(negotiation),
            NegotiationState::Agreed => self.0.agreed(negotiation),
            NegotiationState::Verified => self.0.verified(negotiation),
            NegotiationState::Finalized => self.0.finalized(negotiation),
            NegotiationState::Terminated => self.0.terminated(negotiation),
            _ => Ok(()),
        }
    }
}
