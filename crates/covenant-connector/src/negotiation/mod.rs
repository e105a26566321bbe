// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract negotiation, consumer side.
//!
//! ```text
//! INITIAL ─► REQUESTING ─► REQUESTED ═► AGREED ─► VERIFYING ─► VERIFIED ═► FINALIZED
//!    │           │             │          │           │            │
//!    └───────────┴─────────────┴──────────┴─────┬─────┴────────────┘
//!                                               ▼
//!                                          TERMINATING ─► TERMINATED
//! ```
//!
//! `─►` edges are taken by the manager's handlers, `═►` edges by commands
//! carrying the provider's messages. Any non-terminal state may be
//! terminated by a command or by retry exhaustion.

mod commands;
mod handlers;
mod listener;

use covenant_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

pub use commands::{NegotiationCommand, NegotiationCommandHandler};
pub use handlers::{SendAgreementVerification, SendContractRequest, SendTermination, manager_builder};
pub use listener::{NegotiationListener, NegotiationListenerAdapter};

/// States of a [`ContractNegotiation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    Initial,
    Requesting,
    Requested,
    Agreed,
    Verifying,
    Verified,
    Finalized,
    Terminating,
    Terminated,
}

impl EntityState for NegotiationState {
    const ALL: &'static [Self] = &[
        Self::Initial,
        Self::Requesting,
        Self::Requested,
        Self::Agreed,
        Self::Verifying,
        Self::Verified,
        Self::Finalized,
        Self::Terminating,
        Self::Terminated,
    ];
    const INITIAL: Self = Self::Initial;

    fn code(self) -> i32 {
        match self {
            Self::Initial => 50,
            Self::Requesting => 100,
            Self::Requested => 200,
            Self::Agreed => 850,
            Self::Verifying => 1050,
            Self::Verified => 1100,
            Self::Finalized => 1200,
            Self::Terminating => 1300,
            Self::Terminated => 1400,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::Agreed => "AGREED",
            Self::Verifying => "VERIFYING",
            Self::Verified => "VERIFIED",
            Self::Finalized => "FINALIZED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Initial => &[Self::Requesting, Self::Terminating],
            Self::Requesting => &[Self::Requested, Self::Terminating],
            Self::Requested => &[Self::Agreed, Self::Terminating],
            Self::Agreed => &[Self::Verifying, Self::Terminating],
            Self::Verifying => &[Self::Verified, Self::Terminating],
            Self::Verified => &[Self::Finalized, Self::Terminating],
            Self::Terminating => &[Self::Terminated],
            Self::Finalized | Self::Terminated => &[],
        }
    }

    fn failure_state(self) -> Self {
        match self {
            Self::Terminating | Self::Terminated => Self::Terminated,
            _ => Self::Terminating,
        }
    }
}

/// An offer made by a provider for one of its assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOffer {
    /// Offer ID.
    pub id: String,
    /// Offered asset.
    pub asset_id: String,
    /// Usage policy.
    pub policy: Policy,
}

/// The agreement both parties signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAgreement {
    /// Agreement ID, referenced by transfers.
    pub id: String,
    /// Asset covered.
    pub asset_id: String,
    /// Providing participant.
    pub provider_id: String,
    /// Consuming participant.
    pub consumer_id: String,
    /// Signing time in epoch millis.
    pub signing_date: i64,
    /// Agreed usage policy.
    pub policy: Policy,
}

/// A negotiation for one offer with one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractNegotiation {
    /// Bookkeeping.
    pub meta: EntityMeta<NegotiationState>,
    /// Provider participant ID.
    pub counterparty_id: String,
    /// Provider protocol endpoint.
    pub counterparty_address: String,
    /// The offer being negotiated.
    pub offer: ContractOffer,
    /// Set once the provider agreed.
    pub agreement: Option<ContractAgreement>,
}

impl ContractNegotiation {
    /// A negotiation in [`NegotiationState::Initial`].
    pub fn new(
        id: impl Into<String>,
        counterparty_id: impl Into<String>,
        counterparty_address: impl Into<String>,
        offer: ContractOffer,
        now_millis: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, now_millis),
            counterparty_id: counterparty_id.into(),
            counterparty_address: counterparty_address.into(),
            offer,
            agreement: None,
        }
    }
}

impl StatefulEntity for ContractNegotiation {
    type State = NegotiationState;
    const ENTITY_TYPE: &'static str = "contract_negotiation";

    fn meta(&self) -> &EntityMeta<NegotiationState> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta<NegotiationState> {
        &mut self.meta
    }
}
