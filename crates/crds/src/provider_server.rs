//! OVAProviderServer CRD
//!
//! The inventory server backing one OVA provider: an NFS-backed volume, a catalog
//! Deployment mounting it, and a Service in front of it.

use crate::condition::Condition;
use crate::references::ResourceRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OVAProviderServer",
    namespaced,
    status = "ProviderServerStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OVAProviderServerSpec {
    /// Provider served by this server
    pub provider: ResourceRef,
}

/// Server lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ProviderServerPhase {
    /// Objects created, waiting for endpoints
    #[default]
    #[serde(alias = "pending")]
    Pending,
    /// Service has endpoints
    #[serde(alias = "ready")]
    Ready,
    /// Objects could not be created
    #[serde(alias = "failed")]
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderServerStatus {
    /// Phase
    #[serde(default)]
    pub phase: ProviderServerPhase,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Service fronting the catalog server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ResourceRef>,
}
