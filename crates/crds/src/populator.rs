//! Volume populator CRDs
//!
//! One kind per source family. A claim whose `dataSourceRef` names one of these objects is
//! filled by a populator pod that streams a single source disk into the bound volume.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Populator phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum PopulatorPhase {
    /// Waiting for a claim or pod
    #[default]
    #[serde(alias = "pending")]
    Pending,
    /// Pod is streaming data
    #[serde(alias = "running")]
    Running,
    /// Volume populated and rebound
    #[serde(alias = "succeeded")]
    Succeeded,
    /// Gave up
    #[serde(alias = "failed")]
    Failed,
}

/// Status shared by every populator kind
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PopulatorStatus {
    /// Phase
    #[serde(default)]
    pub phase: PopulatorPhase,

    /// Human readable progress ("42%")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    /// Bytes written
    #[serde(default)]
    pub transferred: u64,

    /// Bytes expected
    #[serde(default)]
    pub total: u64,

    /// Pod restarts spent on transient failures
    #[serde(default)]
    pub retries: u32,

    /// Failure cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OvirtVolumePopulator",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OvirtVolumePopulatorSpec {
    /// oVirt engine URL
    pub engine_url: String,
    /// Secret with engine credentials
    pub engine_secret_name: String,
    /// Disk identifier
    pub disk_id: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OpenstackVolumePopulator",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackVolumePopulatorSpec {
    /// Keystone URL
    pub identity_url: String,
    /// Secret with Keystone credentials
    pub secret_name: String,
    /// Glance image created from the source volume
    pub image_id: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Ec2VolumePopulator",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct Ec2VolumePopulatorSpec {
    /// AWS region
    pub region: String,
    /// Secret with AWS credentials
    pub secret_name: String,
    /// EBS snapshot to read
    pub snapshot_id: String,
    /// Endpoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "VSphereXcopyVolumePopulator",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereXcopyVolumePopulatorSpec {
    /// Source VM identifier
    pub vm_id: String,
    /// Source disk as `[DATASTORE] VM_NAME/DISK.vmdk`
    pub vmdk_path: String,
    /// Secret with vSphere and storage array credentials
    pub secret_name: String,
    /// Storage vendor product (selects the plugin)
    pub storage_vendor_product: String,
    /// Claim to populate
    pub target_pvc: String,
    /// ESXi host to run the copy on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_host: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OffloadPluginVolumePopulator",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OffloadPluginVolumePopulatorSpec {
    /// Plugin image run by the populator pod
    pub image: String,
    /// Source VM identifier
    pub vm_id: String,
    /// Source disk as `[DATASTORE] VM_NAME/DISK.vmdk`
    pub vmdk_path: String,
    /// Secret with vSphere and storage array credentials
    pub secret_name: String,
    /// Claim to populate
    pub target_pvc: String,
}

/// The closed set of populator kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PopulatorKind {
    /// OvirtVolumePopulator
    Ovirt,
    /// OpenstackVolumePopulator
    Openstack,
    /// Ec2VolumePopulator
    Ec2,
    /// VSphereXcopyVolumePopulator
    VSphereXcopy,
    /// OffloadPluginVolumePopulator
    OffloadPlugin,
}

impl PopulatorKind {
    /// Every kind
    pub const ALL: [PopulatorKind; 5] = [
        Self::Ovirt,
        Self::Openstack,
        Self::Ec2,
        Self::VSphereXcopy,
        Self::OffloadPlugin,
    ];

    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ovirt => "OvirtVolumePopulator",
            Self::Openstack => "OpenstackVolumePopulator",
            Self::Ec2 => "Ec2VolumePopulator",
            Self::VSphereXcopy => "VSphereXcopyVolumePopulator",
            Self::OffloadPlugin => "OffloadPluginVolumePopulator",
        }
    }

    /// Parse a Kubernetes kind name
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind)
    }

    /// Short name used in configuration keys
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Ovirt => "ovirt",
            Self::Openstack => "openstack",
            Self::Ec2 => "ec2",
            Self::VSphereXcopy => "xcopy",
            Self::OffloadPlugin => "offload",
        }
    }
}

impl fmt::Display for PopulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in PopulatorKind::ALL {
            assert_eq!(PopulatorKind::from_kind(kind.kind()), Some(kind));
        }
        assert_eq!(PopulatorKind::from_kind("DataVolume"), None);
    }
}
