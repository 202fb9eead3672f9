//! Test utilities for unit testing reconcilers
//!
//! In-memory stand-ins for the destination cluster, the source hypervisor and the event
//! recorder, plus helpers for creating test data.

use crate::adapter::{AdapterError, AdapterFactory, SourceAdapter};
use crate::cluster::{ScratchKind, TargetCluster};
use crate::error::ControllerError;
use crate::events::EventSink;
use async_trait::async_trait;
use crds::{Condition, PowerState, Provider, ProviderSpec, ProviderStatus, ProviderType, SnapshotRef};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Helper to create a Provider in `apps`, Ready when `ready`
pub fn create_test_provider(name: &str, type_: ProviderType, ready: bool) -> Provider {
    let mut provider = Provider::new(name, ProviderSpec {
        type_,
        url: match type_ {
            ProviderType::OpenShift => String::new(),
            ProviderType::Ova => "nfs.example.com:/exports/ova".to_string(),
            _ => format!("https://{}.example.com/sdk", name),
        },
        secret: None,
        settings: BTreeMap::new(),
    });
    provider.metadata.namespace = Some("apps".to_string());
    provider.metadata.uid = Some(format!("{}-uid", name));
    if ready {
        provider.status = Some(ProviderStatus {
            conditions: vec![Condition::ready("The provider is ready.")],
            ..Default::default()
        });
    }
    provider
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

/// RFC 7386 merge patch
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    if let serde_json::Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
    }
}

type ObjectKey = (ScratchKind, String, String);

/// In-memory [`TargetCluster`].
///
/// `generateName` gets a counter suffix, deletes are immediate and recorded.
#[derive(Default)]
pub struct MockCluster {
    objects: Mutex<HashMap<ObjectKey, DynamicObject>>,
    deleted: Mutex<Vec<(ScratchKind, String)>>,
    generated: Mutex<u32>,
}

impl MockCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is (test setup)
    pub fn insert(&self, kind: ScratchKind, obj: DynamicObject) {
        let key = (kind, obj.namespace().unwrap_or_default(), obj.name_any());
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(key, obj);
    }

    /// Replace the `status` of a stored object (simulates another controller)
    pub fn set_status(&self, kind: ScratchKind, namespace: &str, name: &str, status: serde_json::Value) {
        let key = (kind, namespace.to_string(), name.to_string());
        if let Some(obj) = self.objects.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&key) {
            obj.data["status"] = status;
        }
    }

    /// Names of stored objects of a kind, sorted
    pub fn names(&self, kind: ScratchKind) -> Vec<String> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = objects.keys().filter(|(k, _, _)| *k == kind).map(|(_, _, n)| n.clone()).collect();
        out.sort();
        out
    }

    /// Stored object
    pub fn object(&self, kind: ScratchKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind, namespace.to_string(), name.to_string());
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned()
    }

    /// Names deleted so far for a kind, in deletion order
    pub fn deleted(&self, kind: ScratchKind) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl TargetCluster for MockCluster {
    async fn apply(&self, kind: ScratchKind, namespace: &str, mut obj: DynamicObject) -> Result<DynamicObject, ControllerError> {
        if obj.metadata.name.is_none() {
            let mut counter = self.generated.lock().unwrap_or_else(|e| e.into_inner());
            *counter += 1;
            let prefix = obj.metadata.generate_name.clone().unwrap_or_default();
            obj.metadata.name = Some(format!("{}{:05}", prefix, *counter));
        }
        obj.metadata.namespace = Some(namespace.to_string());
        let key = (kind, namespace.to_string(), obj.name_any());
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects.entry(key).or_insert(obj).clone())
    }

    async fn get(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ControllerError> {
        Ok(self.object(kind, namespace, name))
    }

    async fn list(&self, kind: ScratchKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>, ControllerError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<DynamicObject> = objects
            .iter()
            .filter(|((k, ns, _), obj)| *k == kind && ns == namespace && matches_selector(obj, selector))
            .map(|(_, obj)| obj.clone())
            .collect();
        out.sort_by_key(|o| o.name_any());
        Ok(out)
    }

    async fn delete(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<bool, ControllerError> {
        let key = (kind, namespace.to_string(), name.to_string());
        let removed = self.objects.lock().unwrap_or_else(|e| e.into_inner()).remove(&key).is_some();
        if removed {
            self.deleted.lock().unwrap_or_else(|e| e.into_inner()).push((kind, name.to_string()));
        }
        Ok(removed)
    }

    async fn patch(&self, kind: ScratchKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<(), ControllerError> {
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let obj = objects
            .get_mut(&key)
            .ok_or_else(|| ControllerError::NotFound(format!("{} {}/{}", kind.kind(), namespace, name)))?;
        let mut value = serde_json::to_value(&*obj)?;
        merge_patch(&mut value, patch);
        *obj = serde_json::from_value(value)?;
        Ok(())
    }
}

/// Scripted source hypervisor
pub struct MockAdapter {
    power: Mutex<PowerState>,
    must_be_off: bool,
    snapshots: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

impl MockAdapter {
    /// Adapter whose VMs start in `power`
    pub fn new(power: PowerState) -> Self {
        Self { power: Mutex::new(power), must_be_off: false, snapshots: Mutex::new(0), calls: Mutex::new(Vec::new()) }
    }

    /// Adapter that refuses to power off, like Hyper-V
    pub fn read_only(power: PowerState) -> Self {
        Self { must_be_off: true, ..Self::new(power) }
    }

    /// Calls made so far (`power_off vm-1`, `create_snapshot vm-1`, ...)
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn power_state(&self, _vm_id: &str) -> Result<PowerState, AdapterError> {
        Ok(*self.power.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.record(format!("power_off {}", vm_id));
        let mut power = self.power.lock().unwrap_or_else(|e| e.into_inner());
        if self.must_be_off && *power != PowerState::Off {
            return Err(AdapterError::MustBeOff(vm_id.to_string()));
        }
        *power = PowerState::Off;
        Ok(())
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.record(format!("power_on {}", vm_id));
        *self.power.lock().unwrap_or_else(|e| e.into_inner()) = PowerState::On;
        Ok(())
    }

    async fn create_snapshot(&self, vm_id: &str, disk_ids: &[String], _label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        self.record(format!("create_snapshot {}", vm_id));
        let mut counter = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        *counter += 1;
        if disk_ids.is_empty() {
            return Ok(vec![SnapshotRef { id: format!("snap-{}", *counter), disk_id: None }]);
        }
        Ok(disk_ids
            .iter()
            .map(|d| SnapshotRef { id: format!("snap-{}-{}", *counter, d), disk_id: Some(d.clone()) })
            .collect())
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        Ok(Some(snapshot.clone()))
    }

    async fn remove_snapshot(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        self.record(format!("remove_snapshot {} {}", vm_id, snapshot.id));
        Ok(())
    }
}

/// Hands out the same [`MockAdapter`] for every provider
pub struct MockAdapterFactory {
    /// The adapter
    pub adapter: Arc<MockAdapter>,
}

#[async_trait]
impl AdapterFactory for MockAdapterFactory {
    async fn adapter(&self, _provider: &Provider) -> Result<Arc<dyn SourceAdapter>, ControllerError> {
        Ok(Arc::clone(&self.adapter) as Arc<dyn SourceAdapter>)
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// "Normal" or "Warning"
    pub type_: String,
    /// Reason
    pub reason: String,
    /// Note
    pub note: String,
    /// Name of the regarding object
    pub regarding: String,
}

/// [`EventSink`] keeping events in memory
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    /// Events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, type_: &str, regarding: &ObjectReference, reason: &str, note: &str) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(RecordedEvent {
            type_: type_.to_string(),
            reason: reason.to_string(),
            note: note.to_string(),
            regarding: regarding.name.clone().unwrap_or_default(),
        });
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn normal(&self, regarding: &ObjectReference, reason: &str, note: &str) {
        self.push("Normal", regarding, reason, note);
    }

    async fn warning(&self, regarding: &ObjectReference, reason: &str, note: &str) {
        self.push("Warning", regarding, reason, note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(name: Option<&str>, labels: serde_json::Value) -> DynamicObject {
        let mut meta = json!({ "labels": labels, "generateName": "disk-" });
        if let Some(name) = name {
            meta["name"] = json!(name);
        }
        serde_json::from_value(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": meta })).unwrap()
    }

    #[tokio::test]
    async fn test_mock_cluster_generate_name_and_selectors() {
        let cluster = MockCluster::new();
        let created = cluster
            .apply(ScratchKind::Pod, "target", object(None, json!({ "migration": "m1", "vmID": "vm-1" })))
            .await
            .unwrap();
        assert_eq!(created.name_any(), "disk-00001");
        cluster.apply(ScratchKind::Pod, "target", object(Some("other"), json!({ "migration": "m2" }))).await.unwrap();

        let found = cluster.list(ScratchKind::Pod, "target", "migration=m1,vmID=vm-1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(cluster.list(ScratchKind::Pod, "elsewhere", "migration=m1").await.unwrap().is_empty());

        cluster.patch(ScratchKind::Pod, "target", "other", &json!({ "metadata": { "labels": { "migration": null } } })).await.unwrap();
        assert!(cluster.list(ScratchKind::Pod, "target", "migration=m2").await.unwrap().is_empty());

        assert!(cluster.delete(ScratchKind::Pod, "target", "other").await.unwrap());
        assert!(!cluster.delete(ScratchKind::Pod, "target", "other").await.unwrap());
        assert_eq!(cluster.deleted(ScratchKind::Pod), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn test_read_only_adapter_refuses_power_off() {
        let adapter = MockAdapter::read_only(PowerState::On);
        assert!(matches!(adapter.power_off("vm-1").await, Err(AdapterError::MustBeOff(_))));
        assert_eq!(adapter.power_state("vm-1").await.unwrap(), PowerState::On);
    }
}
