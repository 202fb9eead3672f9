//! Provider CRD
//!
//! A source or destination virtualization endpoint.

use crate::condition::Condition;
use crate::references::ResourceRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Provider",
    namespaced,
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider type
    #[serde(rename = "type")]
    pub type_: ProviderType,

    /// Endpoint URL. For OVA providers this is an NFS export (`host:/path`).
    /// Empty for the local cluster.
    #[serde(default)]
    pub url: String,

    /// Credential secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ResourceRef>,

    /// Provider specific settings (sdkEndpoint, vddkInitImage, region, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

/// Well-known keys of `ProviderSpec.settings`
pub mod settings {
    /// vSphere: "vcenter" or "esxi"
    pub const SDK_ENDPOINT: &str = "sdkEndpoint";
    /// vSphere: VDDK init image
    pub const VDDK_INIT_IMAGE: &str = "vddkInitImage";
    /// vSphere: VDDK AIO tuning
    pub const USE_VDDK_AIO_OPTIMIZATION: &str = "useVddkAioOptimization";
    /// EC2: region
    pub const REGION: &str = "region";
    /// OpenStack: project
    pub const PROJECT_NAME: &str = "projectName";
    /// OpenStack: domain
    pub const DOMAIN_NAME: &str = "domainName";
    /// OVA: allow appliance management through the inventory server
    pub const APPLIANCE_MANAGEMENT: &str = "applianceManagement";
}

/// Supported provider families
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// VMware vSphere
    #[default]
    VSphere,
    /// Red Hat oVirt / RHV
    OVirt,
    /// OpenStack
    OpenStack,
    /// OVA archives on an NFS share
    Ova,
    /// Kubernetes cluster with KubeVirt (the migration target)
    OpenShift,
    /// Amazon EC2
    Ec2,
    /// Microsoft Hyper-V
    HyperV,
}

impl ProviderType {
    /// Lowercase name used in URLs and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VSphere => "vsphere",
            Self::OVirt => "ovirt",
            Self::OpenStack => "openstack",
            Self::Ova => "ova",
            Self::OpenShift => "openshift",
            Self::Ec2 => "ec2",
            Self::HyperV => "hyperv",
        }
    }

    /// Source power operations (query and stop) are available
    pub fn supports_power_ops(&self) -> bool {
        !matches!(self, Self::Ova)
    }

    /// Source VMs can only be inspected, never powered off by the controller
    pub fn power_read_only(&self) -> bool {
        matches!(self, Self::HyperV)
    }

    /// Source snapshots are used by cold migrations of this family
    pub fn snapshots_for_cold(&self) -> bool {
        matches!(self, Self::OpenStack | Self::Ec2)
    }

    /// Guest conversion (virt-v2v) is needed to boot the guest on KubeVirt
    pub fn needs_guest_conversion(&self) -> bool {
        matches!(self, Self::VSphere | Self::Ova | Self::Ec2 | Self::HyperV)
    }

    /// Warm (precopy) migration is supported
    pub fn supports_warm(&self) -> bool {
        matches!(self, Self::VSphere | Self::OVirt)
    }

    /// Live migration is supported
    pub fn supports_live(&self) -> bool {
        matches!(self, Self::OpenShift)
    }

    /// Secret keys that must be present for this family
    pub fn required_secret_keys(&self) -> &'static [&'static str] {
        match self {
            Self::VSphere | Self::OVirt => &["user", "password"],
            Self::OpenStack => &["username", "password", "domainName", "projectName", "regionName"],
            Self::Ec2 => &["accessKeyId", "secretAccessKey"],
            Self::Ova | Self::OpenShift | Self::HyperV => &[],
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Conditions (ConnectionTestSucceeded, InventoryCreated, Ready, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Inventory service backing this provider (populated for OVA providers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ResourceRef>,
}

impl Provider {
    /// True when the provider carries a Ready condition and no blockers
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            crate::condition::is_condition_true(&s.conditions, crate::condition::types::READY)
                && !crate::condition::has_blocker(&s.conditions)
        })
    }

    /// True for the local cluster (openshift provider with an empty URL)
    pub fn is_host(&self) -> bool {
        self.spec.type_ == ProviderType::OpenShift && self.spec.url.is_empty()
    }
}
