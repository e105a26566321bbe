// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer process, consumer side.
//!
//! ```text
//! INITIAL ─► PROVISIONING ─► PROVISIONED ─► REQUESTING ─► REQUESTED ═► STARTED ═► COMPLETING ─► COMPLETED
//!    └────────────┴──────────────┴─────────────┴─────────────┴───────────┴────────────┘
//!                                             ▼
//!                                        TERMINATING ─► TERMINATED
//! ```
//!
//! `═►` edges are taken by commands: the provider's start message and the
//! local completion signal.

mod commands;
mod handlers;
mod listener;

use std::collections::BTreeMap;

use covenant_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};

use crate::policy::Policy;
use crate::provision::{ProvisionedResources, ResourceManifest};

pub use commands::{TransferCommand, TransferCommandHandler};
pub use handlers::{Provision, SendCompletion, SendTransferRequest, SendTransferTermination, manager_builder};
pub use listener::{TransferListener, TransferListenerAdapter};

/// States of a [`TransferProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Initial,
    Provisioning,
    Provisioned,
    Requesting,
    Requested,
    Started,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl EntityState for TransferState {
    const ALL: &'static [Self] = &[
        Self::Initial,
        Self::Provisioning,
        Self::Provisioned,
        Self::Requesting,
        Self::Requested,
        Self::Started,
        Self::Completing,
        Self::Completed,
        Self::Terminating,
        Self::Terminated,
    ];
    const INITIAL: Self = Self::Initial;

    fn code(self) -> i32 {
        match self {
            Self::Initial => 100,
            Self::Provisioning => 200,
            Self::Provisioned => 300,
            Self::Requesting => 400,
            Self::Requested => 500,
            Self::Started => 600,
            Self::Completing => 750,
            Self::Completed => 800,
            Self::Terminating => 825,
            Self::Terminated => 850,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Provisioning => "PROVISIONING",
            Self::Provisioned => "PROVISIONED",
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::Started => "STARTED",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Initial => &[Self::Provisioning, Self::Terminating],
            Self::Provisioning => &[Self::Provisioned, Self::Terminating],
            Self::Provisioned => &[Self::Requesting, Self::Terminating],
            Self::Requesting => &[Self::Requested, Self::Terminating],
            Self::Requested => &[Self::Started, Self::Terminating],
            Self::Started => &[Self::Completing, Self::Terminating],
            Self::Completing => &[Self::Completed, Self::Terminating],
            Self::Terminating => &[Self::Terminated],
            Self::Completed | Self::Terminated => &[],
        }
    }

    fn failure_state(self) -> Self {
        match self {
            Self::Terminating | Self::Terminated => Self::Terminated,
            _ => Self::Terminating,
        }
    }
}

impl TransferState {
    /// Whether the transfer is over or on its way out.
    pub fn is_ending(self) -> bool {
        matches!(
            self,
            Self::Completing | Self::Completed | Self::Terminating | Self::Terminated
        )
    }
}

/// Location of data, typed by `kind` with kind-specific properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    /// Address kind, e.g. `HttpData`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    /// An address of `kind` without properties.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// A transfer of one asset under a finalized agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    /// Bookkeeping.
    pub meta: EntityMeta<TransferState>,
    /// Transferred asset.
    pub asset_id: String,
    /// Agreement ID the transfer runs under.
    pub contract_id: String,
    /// Provider participant ID.
    pub counterparty_id: String,
    /// Provider protocol endpoint.
    pub counterparty_address: String,
    /// Usage policy of the agreement, watched by the policy monitor.
    pub policy: Policy,
    /// Where the data should end up.
    pub data_destination: DataAddress,
    /// Resources to provision, built in INITIAL.
    pub manifest: Option<ResourceManifest>,
    /// Provisioning result.
    pub provisioned: Option<ProvisionedResources>,
    /// Source address announced by the provider on start.
    pub data_source: Option<DataAddress>,
}

impl TransferProcess {
    /// A transfer in [`TransferState::Initial`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        asset_id: impl Into<String>,
        contract_id: impl Into<String>,
        counterparty_id: impl Into<String>,
        counterparty_address: impl Into<String>,
        policy: Policy,
        data_destination: DataAddress,
        now_millis: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, now_millis),
            asset_id: asset_id.into(),
            contract_id: contract_id.into(),
            counterparty_id: counterparty_id.into(),
            counterparty_address: counterparty_address.into(),
            policy,
            data_destination,
            manifest: None,
            provisioned: None,
            data_source: None,
        }
    }

    /// Where the provider should deliver: the provisioned destination if
    /// any, the requested one otherwise.
    pub fn effective_destination(&self) -> &DataAddress {
        self.provisioned
            .as_ref()
            .and_then(|p| p.resources.first())
            .map(|r| &r.address)
            .unwrap_or(&self.data_destination)
    }
}

impl StatefulEntity for TransferProcess {
    type State = TransferState;
    const ENTITY_TYPE: &'static str = "transfer_process";

    fn meta(&self) -> &EntityMeta<TransferState> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta<TransferState> {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::ProvisionedResource;

    #[test]
    fn test_every_failure_state_is_reachable() {
        for state in TransferState::ALL.iter().copied().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(state.failure_state()));
        }
    }

    #[test]
    fn test_effective_destination_prefers_provisioned_address() {
        let destination = DataAddress::new("HttpData").with_property("baseUrl", "https://a");
        let mut transfer = TransferProcess::new(
            "t-1",
            "asset-1",
            "agreement-1",
            "provider",
            "https://provider.example/dsp",
            Policy::default(),
            destination.clone(),
            0,
        );
        assert_eq!(transfer.effective_destination(), &destination);

        let provisioned = DataAddress::new("HttpData").with_property("baseUrl", "https://b");
        transfer.provisioned = Some(ProvisionedResources {
            resources: vec![ProvisionedResource {
                definition_id: "t-1-destination".to_string(),
                address: provisioned.clone(),
            }],
        });
        assert_eq!(transfer.effective_destination(), &provisioned);
        assert_eq!(transfer.effective_destination().property("baseUrl"), Some("https://b"));
    }

    #[test]
    fn test_data_address_wire_shape() {
        let address = DataAddress::new("HttpData").with_property("baseUrl", "https://a");
        assert_eq!(
            serde_json::to_value(&address).unwrap(),
            serde_json::json!({ "type": "HttpData", "properties": { "baseUrl": "https://a" } })
        );
    }
}
