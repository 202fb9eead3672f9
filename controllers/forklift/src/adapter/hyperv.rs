//! Hyper-V adapter
//!
//! The controller has no management channel to Hyper-V hosts; the inventory's view of the
//! power state is authoritative and the owner must shut the guest down before cutover.

use super::{AdapterError, SourceAdapter};
use async_trait::async_trait;
use crds::{PowerState, ProviderType, SnapshotRef};
use inventory_client::{InventoryClientTrait, InventoryError, SourceVm};
use std::sync::Arc;

/// Map the inventory's "On"/"Off"
pub fn parse_power_state(value: &str) -> PowerState {
    match value {
        v if v.eq_ignore_ascii_case("off") => PowerState::Off,
        v if v.eq_ignore_ascii_case("on") || v.eq_ignore_ascii_case("running") => PowerState::On,
        _ => PowerState::Unknown,
    }
}

/// Read-only adapter for Hyper-V providers
pub struct HyperVAdapter {
    provider_uid: String,
    inventory: Arc<dyn InventoryClientTrait>,
}

impl HyperVAdapter {
    /// Create an adapter reading the inventory of provider `provider_uid`
    pub fn new(provider_uid: String, inventory: Arc<dyn InventoryClientTrait>) -> Self {
        Self { provider_uid, inventory }
    }
}

fn inventory_error(e: InventoryError) -> AdapterError {
    match e {
        InventoryError::NotFound(what) => AdapterError::NotFound(what),
        other if other.is_transient() => AdapterError::Api { status: 503, message: other.to_string() },
        other => AdapterError::Api { status: 500, message: other.to_string() },
    }
}

#[async_trait]
impl SourceAdapter for HyperVAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        self.inventory
            .get_provider(ProviderType::HyperV, &self.provider_uid)
            .await
            .map(|_| ())
            .map_err(inventory_error)
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        match self.inventory.get_vm(ProviderType::HyperV, &self.provider_uid, vm_id).await {
            Ok(SourceVm::HyperV(vm)) => Ok(parse_power_state(&vm.power_state)),
            Ok(_) => Err(AdapterError::Malformed(format!("VM {} is not a Hyper-V VM", vm_id))),
            Err(e) => Err(inventory_error(e)),
        }
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        match self.power_state(vm_id).await? {
            PowerState::Off => Ok(()),
            _ => Err(AdapterError::MustBeOff(vm_id.to_string())),
        }
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported(format!("cannot power on Hyper-V VM {}", vm_id)))
    }

    async fn create_snapshot(&self, _vm_id: &str, _disk_ids: &[String], _label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        Ok(Vec::new())
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        Ok(Some(snapshot.clone()))
    }

    async fn remove_snapshot(&self, _vm_id: &str, _snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        Ok(())
    }
}
