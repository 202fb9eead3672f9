//! InventoryClient trait for mocking
//!
//! This trait abstracts the InventoryClient to enable mocking in unit tests.
//! The concrete InventoryClient implements this trait, and tests can use mock implementations.

use crate::error::InventoryError;
use crate::models::*;
use crds::ProviderType;

/// Trait for inventory API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait InventoryClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Provider record; `NotReady` until the collector has finished its first pass
    async fn get_provider(&self, provider_type: ProviderType, uid: &str) -> Result<ProviderInfo, InventoryError>;

    // VMs
    async fn get_vm(&self, provider_type: ProviderType, uid: &str, id: &str) -> Result<SourceVm, InventoryError>;
    async fn find_vm(&self, provider_type: ProviderType, uid: &str, name: &str) -> Result<Option<SourceVm>, InventoryError>;

    // Networks and storage
    async fn list_networks(&self, provider_type: ProviderType, uid: &str) -> Result<Vec<Network>, InventoryError>;
    async fn list_storages(&self, provider_type: ProviderType, uid: &str) -> Result<Vec<Storage>, InventoryError>;

    // oVirt
    async fn get_nic_profile(&self, uid: &str, id: &str) -> Result<NicProfile, InventoryError>;
    async fn get_ovirt_disk(&self, uid: &str, id: &str) -> Result<OvirtDisk, InventoryError>;

    // OpenStack
    async fn get_openstack_volume(&self, uid: &str, id: &str) -> Result<OpenstackVolume, InventoryError>;

    // EC2
    async fn get_ec2_volume(&self, uid: &str, id: &str) -> Result<Ec2Volume, InventoryError>;

    // Destination cluster
    async fn list_storage_classes(&self, uid: &str) -> Result<Vec<StorageClass>, InventoryError>;
    async fn list_network_attachment_definitions(&self, uid: &str, namespace: Option<&str>) -> Result<Vec<NetworkAttachmentDefinition>, InventoryError>;
}
