//! KubeVirt source adapter
//!
//! Power is driven through the VirtualMachine's `spec.runStrategy`. VMs are addressed by UID
//! (as listed by the inventory) or by `namespace/name`.

use super::{AdapterError, SourceAdapter};
use crate::cluster::virtual_machine_resource;
use async_trait::async_trait;
use crds::{PowerState, SnapshotRef};
use kube::api::{DynamicObject, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

/// Read the power state from `status.printableStatus`, falling back to the run strategy
pub fn power_state_of(vm: &DynamicObject) -> PowerState {
    match vm.data["status"]["printableStatus"].as_str() {
        Some("Stopped") | Some("Paused") => PowerState::Off,
        Some("Running") | Some("Starting") | Some("Stopping") | Some("Migrating") => PowerState::On,
        _ => match (vm.data["spec"]["runStrategy"].as_str(), vm.data["spec"]["running"].as_bool()) {
            (Some("Halted"), _) | (None, Some(false)) => PowerState::Off,
            (Some("Always"), _) | (Some("RerunOnFailure"), _) | (None, Some(true)) => PowerState::On,
            _ => PowerState::Unknown,
        },
    }
}

/// Adapter for a KubeVirt cluster
pub struct OpenshiftAdapter {
    client: Client,
}

impl OpenshiftAdapter {
    /// Create an adapter on an already authenticated client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn find(&self, vm_id: &str) -> Result<(Api<DynamicObject>, DynamicObject), AdapterError> {
        let resource = virtual_machine_resource();
        if let Some((namespace, name)) = vm_id.split_once('/') {
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);
            return match api.get_opt(name).await? {
                Some(vm) => Ok((api, vm)),
                None => Err(AdapterError::NotFound(format!("VirtualMachine {}", vm_id))),
            };
        }
        let all: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let vm = all
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(|vm| vm.uid().as_deref() == Some(vm_id))
            .ok_or_else(|| AdapterError::NotFound(format!("VirtualMachine {}", vm_id)))?;
        let api = Api::namespaced_with(self.client.clone(), &vm.namespace().unwrap_or_default(), &resource);
        Ok((api, vm))
    }

    async fn run_strategy(&self, vm_id: &str, strategy: &str) -> Result<(), AdapterError> {
        let (api, vm) = self.find(vm_id).await?;
        let patch = json!({ "spec": { "running": null, "runStrategy": strategy } });
        api.patch(&vm.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for OpenshiftAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        self.client.apiserver_version().await?;
        Ok(())
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        Ok(power_state_of(&self.find(vm_id).await?.1))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.run_strategy(vm_id, "Halted").await
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.run_strategy(vm_id, "Always").await
    }

    async fn create_snapshot(&self, _vm_id: &str, _disk_ids: &[String], _label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        Err(AdapterError::Unsupported("KubeVirt sources are migrated cold without snapshots".to_string()))
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        Ok(Some(snapshot.clone()))
    }

    async fn remove_snapshot(&self, _vm_id: &str, _snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(data: serde_json::Value) -> DynamicObject {
        DynamicObject::new("web", &virtual_machine_resource()).data(data)
    }

    #[test]
    fn test_power_state_of() {
        assert_eq!(power_state_of(&vm(json!({"status": {"printableStatus": "Running"}}))), PowerState::On);
        assert_eq!(power_state_of(&vm(json!({"status": {"printableStatus": "Stopped"}}))), PowerState::Off);
        assert_eq!(power_state_of(&vm(json!({"spec": {"runStrategy": "Halted"}}))), PowerState::Off);
        assert_eq!(power_state_of(&vm(json!({"spec": {"running": true}}))), PowerState::On);
        assert_eq!(power_state_of(&vm(json!({}))), PowerState::Unknown);
    }
}
