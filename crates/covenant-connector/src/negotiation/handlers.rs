// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State handlers of the negotiation manager.

use std::sync::Arc;

use async_trait::async_trait;
use covenant_core::manager::StateMachineManagerBuilder;
use covenant_core::{EntityStore, Outcome, StateHandler, StateMachineManager};

use super::{ContractNegotiation, NegotiationState};
use crate::dispatch::{Dispatcher, RemoteMessage, after_dispatch};

/// REQUESTING: send the contract request to the provider.
pub struct SendContractRequest {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendContractRequest {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<ContractNegotiation> for SendContractRequest {
    async fn handle(&self, negotiation: &mut ContractNegotiation) -> Outcome<NegotiationState> {
        let message = RemoteMessage::ContractRequest {
            process_id: negotiation.meta.id().to_string(),
            counterparty_address: negotiation.counterparty_address.clone(),
            offer: negotiation.offer.clone(),
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            NegotiationState::Requested,
        )
    }
}

/// VERIFYING: confirm the agreement received from the provider.
pub struct SendAgreementVerification {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendAgreementVerification {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<ContractNegotiation> for SendAgreementVerification {
    async fn handle(&self, negotiation: &mut ContractNegotiation) -> Outcome<NegotiationState> {
        let Some(agreement) = negotiation.agreement.clone() else {
            return Outcome::fatal("negotiation has no agreement to verify");
        };
        let message = RemoteMessage::ContractAgreementVerification {
            process_id: negotiation.meta.id().to_string(),
            counterparty_address: negotiation.counterparty_address.clone(),
            agreement,
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            NegotiationState::Verified,
        )
    }
}

/// TERMINATING: tell the provider the negotiation is over.
pub struct SendTermination {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendTermination {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<ContractNegotiation> for SendTermination {
    async fn handle(&self, negotiation: &mut ContractNegotiation) -> Outcome<NegotiationState> {
        let message = RemoteMessage::ContractNegotiationTermination {
            process_id: negotiation.meta.id().to_string(),
            counterparty_address: negotiation.counterparty_address.clone(),
            reason: negotiation.meta.error_detail().map(str::to_string),
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            NegotiationState::Terminated,
        )
    }
}

/// Manager builder with the negotiation transition table installed.
///
/// REQUESTED and VERIFIED have no handler; they wait for commands.
pub fn manager_builder(
    store: Arc<dyn EntityStore<ContractNegotiation>>,
    dispatcher: Arc<dyn Dispatcher>,
) -> StateMachineManagerBuilder<ContractNegotiation> {
    StateMachineManager::builder("contract-negotiation", store)
        .on_state_fn(NegotiationState::Initial, |_| {
            Outcome::Proceed(NegotiationState::Requesting)
        })
        .on_state(
            NegotiationState::Requesting,
            SendContractRequest::new(dispatcher.clone()),
        )
        .on_state_fn(NegotiationState::Agreed, |_| {
            Outcome::Proceed(NegotiationState::Verifying)
        })
        .on_state(
            NegotiationState::Verifying,
            SendAgreementVerification::new(dispatcher.clone()),
        )
        .on_state(NegotiationState::Terminating, SendTermination::new(dispatcher))
}
