// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State handlers of the transfer manager.

use std::sync::Arc;

use async_trait::async_trait;
use covenant_core::manager::StateMachineManagerBuilder;
use covenant_core::{EntityStore, Outcome, StateHandler, StateMachineManager};
use tracing::debug;

use super::{TransferProcess, TransferState};
use crate::dispatch::{Dispatcher, RemoteMessage, after_dispatch};
use crate::provision::{ProvisionError, ProvisionedResources, Provisioner, ResourceManifest};

/// PROVISIONING: provision the resources listed in the manifest.
pub struct Provision {
    provisioner: Arc<dyn Provisioner>,
}

impl Provision {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl StateHandler<TransferProcess> for Provision {
    async fn handle(&self, transfer: &mut TransferProcess) -> Outcome<TransferState> {
        let Some(manifest) = transfer.manifest.as_ref() else {
            return Outcome::fatal("transfer has no resource manifest");
        };
        if manifest.is_empty() {
            transfer.provisioned = Some(ProvisionedResources::default());
            return Outcome::Proceed(TransferState::Provisioned);
        }

        match self.provisioner.provision(manifest).await {
            Ok(resources) => {
                debug!(
                    transfer_id = %transfer.meta.id(),
                    resources = resources.resources.len(),
                    "Resources provisioned"
                );
                transfer.provisioned = Some(resources);
                Outcome::Proceed(TransferState::Provisioned)
            }
            Err(e @ ProvisionError::Transient(_)) => Outcome::retry(e.to_string()),
            Err(e) => Outcome::fatal(e.to_string()),
        }
    }
}

/// REQUESTING: ask the provider to start the transfer.
pub struct SendTransferRequest {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendTransferRequest {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<TransferProcess> for SendTransferRequest {
    async fn handle(&self, transfer: &mut TransferProcess) -> Outcome<TransferState> {
        let message = RemoteMessage::TransferRequest {
            process_id: transfer.meta.id().to_string(),
            counterparty_address: transfer.counterparty_address.clone(),
            contract_id: transfer.contract_id.clone(),
            data_destination: transfer.effective_destination().clone(),
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            TransferState::Requested,
        )
    }
}

/// COMPLETING: report completion to the provider.
pub struct SendCompletion {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendCompletion {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<TransferProcess> for SendCompletion {
    async fn handle(&self, transfer: &mut TransferProcess) -> Outcome<TransferState> {
        let message = RemoteMessage::TransferCompletion {
            process_id: transfer.meta.id().to_string(),
            counterparty_address: transfer.counterparty_address.clone(),
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            TransferState::Completed,
        )
    }
}

/// TERMINATING: tell the provider the transfer is aborted.
pub struct SendTransferTermination {
    dispatcher: Arc<dyn Dispatcher>,
}

impl SendTransferTermination {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StateHandler<TransferProcess> for SendTransferTermination {
    async fn handle(&self, transfer: &mut TransferProcess) -> Outcome<TransferState> {
        let message = RemoteMessage::TransferTermination {
            process_id: transfer.meta.id().to_string(),
            counterparty_address: transfer.counterparty_address.clone(),
            reason: transfer.meta.error_detail().map(str::to_string),
        };
        after_dispatch(
            self.dispatcher.dispatch(message).await,
            TransferState::Terminated,
        )
    }
}

/// Manager builder with the transfer transition table installed.
///
/// REQUESTED and STARTED have no handler; they wait for commands.
pub fn manager_builder(
    store: Arc<dyn EntityStore<TransferProcess>>,
    dispatcher: Arc<dyn Dispatcher>,
    provisioner: Arc<dyn Provisioner>,
) -> StateMachineManagerBuilder<TransferProcess> {
    StateMachineManager::builder("transfer-process", store)
        .on_state_fn(TransferState::Initial, |transfer: &mut TransferProcess| {
            transfer.manifest = Some(ResourceManifest::for_destination(
                transfer.meta.id(),
                &transfer.data_destination,
            ));
            Outcome::Proceed(TransferState::Provisioning)
        })
        .on_state(TransferState::Provisioning, Provision::new(provisioner))
        .on_state_fn(TransferState::Provisioned, |_| {
            Outcome::Proceed(TransferState::Requesting)
        })
        .on_state(
            TransferState::Requesting,
            SendTransferRequest::new(dispatcher.clone()),
        )
        .on_state(
            TransferState::Completing,
            SendCompletion::new(dispatcher.clone()),
        )
        .on_state(
            TransferState::Terminating,
            SendTransferTermination::new(dispatcher),
        )
}
