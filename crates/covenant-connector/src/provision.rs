// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning of transfer resources (buckets, queues, credentials).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::DataAddress;

/// One resource to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Definition ID, unique within its manifest.
    pub id: String,
    /// Resource kind, e.g. `HttpData` or `AmazonS3`.
    pub kind: String,
    /// Kind-specific settings.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Everything a transfer needs provisioned before it can be requested.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifest {
    /// Resources to provision.
    pub definitions: Vec<ResourceDefinition>,
}

impl ResourceManifest {
    /// Manifest with one definition for `destination`.
    pub fn for_destination(transfer_id: &str, destination: &DataAddress) -> Self {
        Self {
            definitions: vec![ResourceDefinition {
                id: format!("{transfer_id}-destination"),
                kind: destination.kind.clone(),
                properties: destination.properties.clone(),
            }],
        }
    }

    /// Whether nothing needs provisioning.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResource {
    /// ID of the definition this resource satisfies.
    pub definition_id: String,
    /// Where the resource can be reached.
    pub address: DataAddress,
}

/// Result of provisioning a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResources {
    /// One entry per definition.
    pub resources: Vec<ProvisionedResource>,
}

/// Why provisioning failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// Temporary failure, provisioning may be retried.
    #[error("Provisioning failed temporarily: {0}")]
    Transient(String),

    /// Provisioning cannot succeed for this manifest.
    #[error("Provisioning failed: {0}")]
    Fatal(String),
}

/// Provisions transfer resources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision every definition in `manifest`. Must be idempotent: a
    /// transfer whose result could not be saved provisions again.
    async fn provision(
        &self,
        manifest: &ResourceManifest,
    ) -> Result<ProvisionedResources, ProvisionError>;
}

/// Provisioner that hands every definition back unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(
        &self,
        manifest: &ResourceManifest,
    ) -> Result<ProvisionedResources, ProvisionError> {
        Ok(ProvisionedResources {
            resources: manifest
                .definitions
                .iter()
                .map(|definition| ProvisionedResource {
                    definition_id: definition.id.clone(),
                    address: DataAddress {
                        kind: definition.kind.clone(),
                        properties: definition.properties.clone(),
                    },
                })
                .collect(),
        })
    }
}
