//! OVA archives have no running guest: the VM is always off and there is nothing to
//! snapshot.

use super::{AdapterError, SourceAdapter};
use async_trait::async_trait;
use crds::{PowerState, SnapshotRef};

/// Adapter for OVA providers
pub struct OvaAdapter;

#[async_trait]
impl SourceAdapter for OvaAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn power_state(&self, _vm_id: &str) -> Result<PowerState, AdapterError> {
        Ok(PowerState::Off)
    }

    async fn power_off(&self, _vm_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported(format!("cannot power on OVA appliance {}", vm_id)))
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
