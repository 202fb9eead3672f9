//! Hook CRD
//!
//! A container image, optionally with an Ansible playbook, run as a Job before or after a VM migrates.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Hook",
    namespaced,
    status = "HookStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// Container image
    pub image: String,

    /// Base64 encoded Ansible playbook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,

    /// Service account the Job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Job deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
