//! Network and storage mapping resolution.
//!
//! Source fetchers turn the inventory records of the VMs in a plan into the networks and
//! storages they use; one family struct per provider type implements both fetchers and is
//! picked by [`source_family`]. Target fetchers list what the destination cluster offers.
//! The resolvers in [`network`] and [`storage`] combine both sides into ordered pairs.

pub mod network;
pub mod reconcile;
pub mod source;
pub mod storage;

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{ProviderType, SourceRef};
use inventory_client::{InventoryClientTrait, NetworkAttachmentDefinition, SourceVm, StorageClass};
use std::collections::BTreeMap;

/// Pseudo source reference of the KubeVirt pod network
pub const POD_NETWORK: &str = "pod";

/// Inventory of the source provider a plan reads from
pub struct SourceContext<'a> {
    /// Inventory client
    pub inventory: &'a dyn InventoryClientTrait,
    /// Source provider type
    pub provider_type: ProviderType,
    /// Source provider UID
    pub provider_uid: &'a str,
}

/// A source network used by a VM
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceNetwork {
    /// How mapping pairs refer to it
    pub source: SourceRef,
    /// Display name, used for same-name matching
    pub name: String,
    /// KubeVirt pod network
    pub pod: bool,
}

/// One VM NIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNic {
    /// MAC address, empty when unknown
    pub mac: String,
    /// Network the NIC is attached to
    pub network: SourceNetwork,
}

/// A source storage (datastore, storage domain, volume type, class)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceStorage {
    /// How mapping pairs refer to it
    pub source: SourceRef,
    /// Display name
    pub name: String,
}

/// One VM disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDisk {
    /// Inventory identifier of the disk (volume id, disk id, claim name)
    pub id: String,
    /// Backing storage
    pub storage: SourceStorage,
    /// Size in bytes
    pub capacity: u64,
    /// Disk file (vSphere VMDK path, OVA file)
    pub file: String,
    /// Attached to more than one VM
    pub shared: bool,
}

/// Lists the networks a source VM uses
#[async_trait]
pub trait SourceNetworkFetcher: Send + Sync {
    /// NICs of one VM, in device order
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError>;
}

/// Lists the storages a source VM uses
#[async_trait]
pub trait SourceStorageFetcher: Send + Sync {
    /// Disks of one VM, in device order
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError>;
}

/// Both fetchers of one provider family
pub trait SourceFamily: SourceNetworkFetcher + SourceStorageFetcher {}

impl<T: SourceNetworkFetcher + SourceStorageFetcher> SourceFamily for T {}

static VSPHERE: source::VSphereFamily = source::VSphereFamily;
static OVIRT: source::OvirtFamily = source::OvirtFamily;
static OPENSTACK: source::OpenstackFamily = source::OpenstackFamily;
static EC2: source::Ec2Family = source::Ec2Family;
static IMAGE: source::ImageFamily = source::ImageFamily;
static OPENSHIFT: source::OpenshiftFamily = source::OpenshiftFamily;

/// Fetchers of a provider type
pub fn source_family(provider_type: ProviderType) -> &'static dyn SourceFamily {
    match provider_type {
        ProviderType::VSphere => &VSPHERE,
        ProviderType::OVirt => &OVIRT,
        ProviderType::OpenStack => &OPENSTACK,
        ProviderType::Ec2 => &EC2,
        ProviderType::Ova | ProviderType::HyperV => &IMAGE,
        ProviderType::OpenShift => &OPENSHIFT,
    }
}

/// Distinct networks used by a set of VMs, sorted
pub async fn source_networks(ctx: &SourceContext<'_>, vms: &[SourceVm]) -> Result<Vec<SourceNetwork>, ControllerError> {
    let family = source_family(ctx.provider_type);
    let mut out = Vec::new();
    for vm in vms {
        out.extend(family.nics(ctx, vm).await?.into_iter().map(|nic| nic.network));
    }
    out.sort();
    out.dedup_by(|a, b| a.source == b.source);
    Ok(out)
}

/// Distinct storages used by a set of VMs, sorted
pub async fn source_storages(ctx: &SourceContext<'_>, vms: &[SourceVm]) -> Result<Vec<SourceStorage>, ControllerError> {
    let family = source_family(ctx.provider_type);
    let mut out = Vec::new();
    for vm in vms {
        out.extend(family.disks(ctx, vm).await?.into_iter().map(|disk| disk.storage));
    }
    out.sort();
    out.dedup_by(|a, b| a.source == b.source);
    Ok(out)
}

/// Lists network attachment definitions on the destination
#[async_trait]
pub trait TargetNetworkFetcher: Send + Sync {
    /// Definitions visible from `namespace` (its own and the cluster-wide default namespace)
    async fn network_attachments(&self, namespace: Option<&str>) -> Result<Vec<NetworkAttachmentDefinition>, ControllerError>;
}

/// Lists storage classes on the destination
#[async_trait]
pub trait TargetStorageFetcher: Send + Sync {
    /// Every storage class
    async fn storage_classes(&self) -> Result<Vec<StorageClass>, ControllerError>;
}

/// Target fetchers backed by the destination provider's inventory
pub struct InventoryTargets<'a> {
    inventory: &'a dyn InventoryClientTrait,
    provider_uid: &'a str,
}

impl<'a> InventoryTargets<'a> {
    /// Read the inventory of destination provider `provider_uid`
    pub fn new(inventory: &'a dyn InventoryClientTrait, provider_uid: &'a str) -> Self {
        Self { inventory, provider_uid }
    }
}

#[async_trait]
impl TargetNetworkFetcher for InventoryTargets<'_> {
    async fn network_attachments(&self, namespace: Option<&str>) -> Result<Vec<NetworkAttachmentDefinition>, ControllerError> {
        let mut nads = self.inventory.list_network_attachment_definitions(self.provider_uid, namespace).await?;
        nads.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(nads)
    }
}

#[async_trait]
impl TargetStorageFetcher for InventoryTargets<'_> {
    async fn storage_classes(&self) -> Result<Vec<StorageClass>, ControllerError> {
        Ok(self.inventory.list_storage_classes(self.provider_uid).await?)
    }
}

/// True when the source side of a mapping pair denotes `source` (displayed as `name`).
///
/// A pair with an id only matches by id; a pair with a name only matches either the display
/// name or the name the fetcher referenced it by.
pub fn covers(pair: &SourceRef, source: &SourceRef, name: &str) -> bool {
    if !pair.id.is_empty() {
        return !source.id.is_empty() && pair.id == source.id;
    }
    !pair.name.is_empty() && (pair.name == name || pair.name == source.name || pair.name == source.id)
}

/// id → name table of a provider's networks or storages
pub(crate) fn names<I: IntoIterator<Item = (String, String)>>(items: I) -> BTreeMap<String, String> {
    items.into_iter().collect()
}
