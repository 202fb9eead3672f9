//! Mock InventoryClient for unit testing
//!
//! Stores inventory objects in memory, keyed by provider UID, so controllers can be
//! tested without a running inventory service.

use crate::error::InventoryError;
use crate::inventory_trait::InventoryClientTrait;
use crate::models::*;
use crds::ProviderType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ProviderData {
    info: Option<ProviderInfo>,
    vms: Vec<SourceVm>,
    networks: Vec<Network>,
    storages: Vec<Storage>,
    nic_profiles: HashMap<String, NicProfile>,
    ovirt_disks: HashMap<String, OvirtDisk>,
    openstack_volumes: HashMap<String, OpenstackVolume>,
    ec2_volumes: HashMap<String, Ec2Volume>,
    storage_classes: Vec<StorageClass>,
    nads: Vec<NetworkAttachmentDefinition>,
}

/// Mock InventoryClient for testing
#[derive(Clone, Debug)]
pub struct MockInventoryClient {
    base_url: String,
    providers: Arc<Mutex<HashMap<String, ProviderData>>>,
}

impl MockInventoryClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            providers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_provider<R>(&self, uid: &str, f: impl FnOnce(&mut ProviderData) -> R) -> R {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        f(providers.entry(uid.to_string()).or_default())
    }

    fn read<R>(&self, uid: &str, f: impl FnOnce(&ProviderData) -> R) -> Option<R> {
        let providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers.get(uid).map(f)
    }

    /// Mark a provider as collected
    pub fn add_provider(&self, uid: &str, name: &str, namespace: &str) {
        self.with_provider(uid, |p| {
            p.info = Some(ProviderInfo {
                uid: uid.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
                vm_count: Some(0),
            });
        });
    }

    /// Add a VM
    pub fn add_vm(&self, uid: &str, vm: SourceVm) {
        self.with_provider(uid, |p| p.vms.push(vm));
    }

    /// Add a source network (or NAD for openshift providers)
    pub fn add_network(&self, uid: &str, network: Network) {
        self.with_provider(uid, |p| p.networks.push(network));
    }

    /// Add a source storage
    pub fn add_storage(&self, uid: &str, storage: Storage) {
        self.with_provider(uid, |p| p.storages.push(storage));
    }

    /// Add an oVirt vNIC profile
    pub fn add_nic_profile(&self, uid: &str, profile: NicProfile) {
        self.with_provider(uid, |p| {
            p.nic_profiles.insert(profile.id.clone(), profile);
        });
    }

    /// Add an oVirt disk
    pub fn add_ovirt_disk(&self, uid: &str, disk: OvirtDisk) {
        self.with_provider(uid, |p| {
            p.ovirt_disks.insert(disk.id.clone(), disk);
        });
    }

    /// Add an OpenStack volume
    pub fn add_openstack_volume(&self, uid: &str, volume: OpenstackVolume) {
        self.with_provider(uid, |p| {
            p.openstack_volumes.insert(volume.id.clone(), volume);
        });
    }

    /// Add an EBS volume
    pub fn add_ec2_volume(&self, uid: &str, volume: Ec2Volume) {
        self.with_provider(uid, |p| {
            p.ec2_volumes.insert(volume.id.clone(), volume);
        });
    }

    /// Add a destination storage class
    pub fn add_storage_class(&self, uid: &str, class: StorageClass) {
        self.with_provider(uid, |p| p.storage_classes.push(class));
    }

    /// Add a destination network attachment definition
    pub fn add_nad(&self, uid: &str, nad: NetworkAttachmentDefinition) {
        self.with_provider(uid, |p| p.nads.push(nad));
    }

    fn not_found(what: &str, id: &str) -> InventoryError {
        InventoryError::NotFound(format!("{} {}", what, id))
    }
}

#[async_trait::async_trait]
impl InventoryClientTrait for MockInventoryClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_provider(&self, _provider_type: ProviderType, uid: &str) -> Result<ProviderInfo, InventoryError> {
        match self.read(uid, |p| p.info.clone()) {
            Some(Some(info)) => Ok(info),
            Some(None) => Err(InventoryError::NotReady(uid.to_string())),
            None => Err(Self::not_found("provider", uid)),
        }
    }

    async fn get_vm(&self, _provider_type: ProviderType, uid: &str, id: &str) -> Result<SourceVm, InventoryError> {
        self.read(uid, |p| p.vms.iter().find(|vm| vm.id() == id).cloned())
            .flatten()
            .ok_or_else(|| Self::not_found("vm", id))
    }

    async fn find_vm(&self, _provider_type: ProviderType, uid: &str, name: &str) -> Result<Option<SourceVm>, InventoryError> {
        Ok(self
            .read(uid, |p| p.vms.iter().find(|vm| vm.name() == name).cloned())
            .flatten())
    }

    async fn list_networks(&self, _provider_type: ProviderType, uid: &str) -> Result<Vec<Network>, InventoryError> {
        Ok(self.read(uid, |p| p.networks.clone()).unwrap_or_default())
    }

    async fn list_storages(&self, _provider_type: ProviderType, uid: &str) -> Result<Vec<Storage>, InventoryError> {
        Ok(self.read(uid, |p| p.storages.clone()).unwrap_or_default())
    }

    async fn get_nic_profile(&self, uid: &str, id: &str) -> Result<NicProfile, InventoryError> {
        self.read(uid, |p| p.nic_profiles.get(id).cloned())
            .flatten()
            .ok_or_else(|| Self::not_found("nic profile", id))
    }

    async fn get_ovirt_disk(&self, uid: &str, id: &str) -> Result<OvirtDisk, InventoryError> {
        self.read(uid, |p| p.ovirt_disks.get(id).cloned())
            .flatten()
            .ok_or_else(|| Self::not_found("disk", id))
    }

    async fn get_openstack_volume(&self, uid: &str, id: &str) -> Result<OpenstackVolume, InventoryError> {
        self.read(uid, |p| p.openstack_volumes.get(id).cloned())
            .flatten()
            .ok_or_else(|| Self::not_found("volume", id))
    }

    async fn get_ec2_volume(&self, uid: &str, id: &str) -> Result<Ec2Volume, InventoryError> {
        self.read(uid, |p| p.ec2_volumes.get(id).cloned())
            .flatten()
            .ok_or_else(|| Self::not_found("volume", id))
    }

    async fn list_storage_classes(&self, uid: &str) -> Result<Vec<StorageClass>, InventoryError> {
        Ok(self.read(uid, |p| p.storage_classes.clone()).unwrap_or_default())
    }

    async fn list_network_attachment_definitions(
        &self,
        uid: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<NetworkAttachmentDefinition>, InventoryError> {
        Ok(self
            .read(uid, |p| {
                p.nads
                    .iter()
                    .filter(|nad| namespace.is_none_or(|ns| nad.namespace == ns))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
