//! NetworkMap and StorageMap CRDs
//!
//! Ordered pairs mapping source inventory networks/storages to destinations on the target cluster.

use crate::condition::Condition;
use crate::references::{ResourceRef, SourceRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source and destination providers of a mapping or plan
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPair {
    /// Source provider
    pub source: ResourceRef,

    /// Destination provider
    pub destination: ResourceRef,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "NetworkMap",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapSpec {
    /// Providers
    pub provider: ProviderPair,

    /// Ordered network pairs
    #[serde(default)]
    pub map: Vec<NetworkPair>,
}

/// A source network mapped to a destination
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPair {
    /// Source network
    pub source: SourceRef,

    /// Destination network
    pub destination: NetworkDestination,
}

/// Kind of destination network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// The pod network
    #[default]
    Pod,
    /// Not attached on the target
    Ignored,
    /// A network attachment definition
    Multus,
}

/// Destination network
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDestination {
    /// Destination kind
    #[serde(rename = "type")]
    pub type_: NetworkType,

    /// NAD namespace (multus only; defaults to the target namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// NAD name (multus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NetworkDestination {
    /// The pod network
    pub fn pod() -> Self {
        Self::default()
    }

    /// Not attached
    pub fn ignored() -> Self {
        Self {
            type_: NetworkType::Ignored,
            namespace: None,
            name: None,
        }
    }

    /// A multus network attachment
    pub fn multus(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            type_: NetworkType::Multus,
            namespace,
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for NetworkDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_ {
            NetworkType::Pod => f.write_str("pod"),
            NetworkType::Ignored => f.write_str("ignored"),
            NetworkType::Multus => write!(
                f,
                "multus({}/{})",
                self.namespace.as_deref().unwrap_or("."),
                self.name.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "StorageMap",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapSpec {
    /// Providers
    pub provider: ProviderPair,

    /// Ordered storage pairs
    #[serde(default)]
    pub map: Vec<StoragePair>,
}

/// A source storage (datastore, storage domain, volume type...) mapped to a storage class
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoragePair {
    /// Source storage
    pub source: SourceRef,

    /// Destination storage
    pub destination: StorageDestination,
}

/// Volume mode of created claims
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum VolumeMode {
    /// Raw block device
    Block,
    /// Filesystem with a disk image
    Filesystem,
}

impl VolumeMode {
    /// Kubernetes spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "Block",
            Self::Filesystem => "Filesystem",
        }
    }
}

/// Access mode of created claims
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    /// ReadWriteOnce
    ReadWriteOnce,
    /// ReadWriteMany
    ReadWriteMany,
    /// ReadOnlyMany
    ReadOnlyMany,
}

impl AccessMode {
    /// Kubernetes spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWriteOnce => "ReadWriteOnce",
            Self::ReadWriteMany => "ReadWriteMany",
            Self::ReadOnlyMany => "ReadOnlyMany",
        }
    }
}

/// Destination storage
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageDestination {
    /// Storage class
    pub storage_class: String,

    /// Volume mode (storage profile default when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,

    /// Access mode (storage profile default when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,

    /// Offload plugin image (storage array assisted copy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_plugin: Option<String>,

    /// Secret with storage array credentials for the offload plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_secret: Option<String>,

    /// Storage vendor product handled by the XCOPY populator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_vendor: Option<String>,
}

impl StorageDestination {
    /// True when disks on this storage are copied by the array
    pub fn is_offload(&self) -> bool {
        self.offload_plugin.is_some() || self.offload_vendor.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapStatus {
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_destination_display() {
        assert_eq!(NetworkDestination::pod().to_string(), "pod");
        assert_eq!(NetworkDestination::ignored().to_string(), "ignored");
        assert_eq!(
            NetworkDestination::multus(None, "vm-net-a").to_string(),
            "multus(./vm-net-a)"
        );
        assert_eq!(
            NetworkDestination::multus(Some("ns1".to_string()), "prod").to_string(),
            "multus(ns1/prod)"
        );
    }

    #[test]
    fn test_network_destination_serialization() {
        let json = serde_json::to_value(NetworkDestination::multus(Some("ns1".to_string()), "prod")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "multus", "namespace": "ns1", "name": "prod"}));
    }
}
