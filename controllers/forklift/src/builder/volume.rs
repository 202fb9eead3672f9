//! Target volumes: claims, populator objects, CDI DataVolumes and the credential copy they read.

use super::{ClaimName, VmContext};
use crate::adapter::SecretData;
use crate::cluster::to_dynamic;
use crate::error::ControllerError;
use crate::mapping::SourceDisk;
use crds::{
    labels, settings, Ec2VolumePopulator, Ec2VolumePopulatorSpec, OffloadPluginVolumePopulator,
    OffloadPluginVolumePopulatorSpec, OpenstackVolumePopulator, OpenstackVolumePopulatorSpec, OvirtVolumePopulator,
    OvirtVolumePopulatorSpec, PopulatorKind, PopulatorStatus, Provider, ProviderType, SnapshotRef, StorageDestination,
    VSphereXcopyVolumePopulator, VSphereXcopyVolumePopulatorSpec,
};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

const MIB: u64 = 1 << 20;

/// Annotation on claims naming the source disk
pub const SOURCE_DISK_ANNOTATION: &str = "forklift.konveyor.io/disk-source";

/// One disk on its way to a target volume
#[derive(Debug, Clone)]
pub struct DiskVolume<'a> {
    /// Position of the disk in the VM
    pub index: usize,
    /// Source disk
    pub disk: &'a SourceDisk,
    /// Storage pair destination of the disk's storage
    pub destination: &'a StorageDestination,
}

/// Populator kind for a disk, `None` when the provider does not transfer through populators
pub fn populator_kind(provider: ProviderType, destination: &StorageDestination) -> Option<PopulatorKind> {
    match provider {
        ProviderType::OVirt => Some(PopulatorKind::Ovirt),
        ProviderType::OpenStack => Some(PopulatorKind::Openstack),
        ProviderType::Ec2 => Some(PopulatorKind::Ec2),
        ProviderType::VSphere if destination.offload_plugin.as_deref().is_some_and(|p| !p.is_empty()) => {
            Some(PopulatorKind::OffloadPlugin)
        }
        ProviderType::VSphere if destination.is_offload() => Some(PopulatorKind::VSphereXcopy),
        _ => None,
    }
}

/// Requested size: the capacity rounded up to whole mebibytes
pub fn requested_size(capacity: u64) -> Quantity {
    let mib = capacity.div_ceil(MIB).max(1);
    Quantity(format!("{}Mi", mib))
}

fn disk_labels(ctx: &VmContext<'_>, volume: &DiskVolume<'_>) -> BTreeMap<String, String> {
    let mut out = ctx.labels();
    out.insert(labels::DISK_ID.to_string(), super::label_value(&volume.disk.id));
    out
}

/// `dataSourceRef` of a claim filled by a populator object
pub fn data_source_ref(kind: PopulatorKind, name: &str) -> corev1::TypedObjectReference {
    corev1::TypedObjectReference {
        api_group: Some(crds::GROUP.to_string()),
        kind: kind.kind().to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

/// Claim of one disk; `data_source` is set when a populator fills it
pub fn build_claim(
    ctx: &VmContext<'_>,
    volume: &DiskVolume<'_>,
    name: &ClaimName,
    data_source: Option<corev1::TypedObjectReference>,
) -> corev1::PersistentVolumeClaim {
    let (name, generate_name) = match name {
        ClaimName::Fixed(n) => (Some(n.clone()), None),
        ClaimName::Prefix(p) => (None, Some(p.clone())),
    };
    let destination = volume.destination;
    corev1::PersistentVolumeClaim {
        metadata: metav1::ObjectMeta {
            name,
            generate_name,
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(disk_labels(ctx, volume)),
            annotations: Some(BTreeMap::from([(SOURCE_DISK_ANNOTATION.to_string(), volume.disk.id.clone())])),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PersistentVolumeClaimSpec {
            access_modes: Some(vec![
                destination.access_mode.map(|m| m.as_str()).unwrap_or("ReadWriteOnce").to_string(),
            ]),
            resources: Some(corev1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), requested_size(volume.disk.capacity))])),
                ..corev1::VolumeResourceRequirements::default()
            }),
            storage_class_name: Some(destination.storage_class.clone()).filter(|c| !c.is_empty()),
            volume_mode: Some(destination.volume_mode.map(|m| m.as_str()).unwrap_or("Filesystem").to_string()),
            data_source_ref: data_source,
            ..corev1::PersistentVolumeClaimSpec::default()
        }),
        ..corev1::PersistentVolumeClaim::default()
    }
}

/// Source coordinates a populator object needs beyond the disk itself
#[derive(Debug, Clone)]
pub struct PopulatorInputs<'a> {
    /// Source provider
    pub provider: &'a Provider,
    /// Credential secret in the target namespace
    pub secret_name: &'a str,
    /// Source VM identifier
    pub vm_id: &'a str,
    /// Snapshots taken for the VM
    pub snapshots: &'a [SnapshotRef],
    /// Name of the claim being populated
    pub claim_name: &'a str,
}

fn snapshot_of<'a>(inputs: &'a PopulatorInputs<'_>, disk: &SourceDisk) -> Result<&'a str, ControllerError> {
    inputs
        .snapshots
        .iter()
        .find(|s| s.disk_id.as_deref() == Some(disk.id.as_str()))
        .map(|s| s.id.as_str())
        .ok_or_else(|| ControllerError::NotFound(format!("snapshot of disk {}", disk.id)))
}

fn with_meta<K: Serialize>(obj: K, ctx: &VmContext<'_>, volume: &DiskVolume<'_>) -> Result<DynamicObject, ControllerError> {
    let mut dynamic = to_dynamic(&obj)?;
    dynamic.metadata.namespace = Some(ctx.namespace().to_string());
    dynamic.metadata.labels = Some(disk_labels(ctx, volume));
    Ok(dynamic)
}

/// Populator object of one disk, named after the disk's scratch name
pub fn build_populator(
    ctx: &VmContext<'_>,
    kind: PopulatorKind,
    volume: &DiskVolume<'_>,
    inputs: &PopulatorInputs<'_>,
) -> Result<DynamicObject, ControllerError> {
    let name = ctx.disk_object_name(volume.index);
    let provider = &inputs.provider.spec;
    let destination = volume.destination;
    match kind {
        PopulatorKind::Ovirt => with_meta(
            OvirtVolumePopulator::new(&name, OvirtVolumePopulatorSpec {
                engine_url: provider.url.clone(),
                engine_secret_name: inputs.secret_name.to_string(),
                disk_id: volume.disk.id.clone(),
            }),
            ctx,
            volume,
        ),
        PopulatorKind::Openstack => with_meta(
            OpenstackVolumePopulator::new(&name, OpenstackVolumePopulatorSpec {
                identity_url: provider.url.clone(),
                secret_name: inputs.secret_name.to_string(),
                image_id: snapshot_of(inputs, volume.disk)?.to_string(),
            }),
            ctx,
            volume,
        ),
        PopulatorKind::Ec2 => with_meta(
            Ec2VolumePopulator::new(&name, Ec2VolumePopulatorSpec {
                region: provider.settings.get(settings::REGION).cloned().unwrap_or_default(),
                secret_name: inputs.secret_name.to_string(),
                snapshot_id: snapshot_of(inputs, volume.disk)?.to_string(),
                endpoint: Some(provider.url.clone()).filter(|e| !e.is_empty()),
            }),
            ctx,
            volume,
        ),
        PopulatorKind::VSphereXcopy => with_meta(
            VSphereXcopyVolumePopulator::new(&name, VSphereXcopyVolumePopulatorSpec {
                vm_id: inputs.vm_id.to_string(),
                vmdk_path: volume.disk.file.clone(),
                secret_name: destination.offload_secret.clone().unwrap_or_else(|| inputs.secret_name.to_string()),
                storage_vendor_product: destination.offload_vendor.clone().unwrap_or_default(),
                target_pvc: inputs.claim_name.to_string(),
                migration_host: None,
            }),
            ctx,
            volume,
        ),
        PopulatorKind::OffloadPlugin => with_meta(
            OffloadPluginVolumePopulator::new(&name, OffloadPluginVolumePopulatorSpec {
                image: destination.offload_plugin.clone().unwrap_or_default(),
                vm_id: inputs.vm_id.to_string(),
                vmdk_path: volume.disk.file.clone(),
                secret_name: destination.offload_secret.clone().unwrap_or_else(|| inputs.secret_name.to_string()),
                target_pvc: inputs.claim_name.to_string(),
            }),
            ctx,
            volume,
        ),
    }
}

/// Status of a populator object, default while the populator controller has not written one
pub fn populator_status(obj: &DynamicObject) -> PopulatorStatus {
    obj.data
        .get("status")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default()
}

/// Copy of the source credentials in the target namespace.
///
/// Populator pods and the conversion pod take it with `envFrom`; CDI reads the
/// `accessKeyId`/`secretKey` pair, filled from the user and password keys.
pub fn build_transfer_secret(ctx: &VmContext<'_>, data: &SecretData) -> corev1::Secret {
    let mut out: BTreeMap<String, ByteString> = data
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone().into_bytes())))
        .collect();
    let user = data.get("user").or_else(|| data.get("username"));
    if let (Some(user), Some(password)) = (user, data.get("password")) {
        out.entry("accessKeyId".to_string()).or_insert_with(|| ByteString(user.clone().into_bytes()));
        out.entry("secretKey".to_string()).or_insert_with(|| ByteString(password.clone().into_bytes()));
    }
    corev1::Secret {
        metadata: metav1::ObjectMeta {
            name: Some(ctx.role_name("source")),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(ctx.labels()),
            ..metav1::ObjectMeta::default()
        },
        data: Some(out),
        type_: Some("Opaque".to_string()),
        ..corev1::Secret::default()
    }
}

/// Where a DataVolume imports from
#[derive(Debug, Clone, PartialEq)]
pub enum DataVolumeSource {
    /// vSphere through VDDK, incremental by change block tracking
    Vddk {
        /// SDK URL
        url: String,
        /// BIOS UUID of the source VM
        uuid: String,
        /// Disk file
        backing_file: String,
        /// Secret with `accessKeyId`/`secretKey`
        secret: String,
        /// VDDK init image
        init_image: Option<String>,
    },
    /// oVirt image transfers
    Imageio {
        /// Engine API URL
        url: String,
        /// Disk identifier
        disk_id: String,
        /// Secret with `accessKeyId`/`secretKey`
        secret: String,
    },
    /// Clone of a claim on a KubeVirt source
    Pvc {
        /// Claim namespace
        namespace: String,
        /// Claim name
        name: String,
    },
}

impl DataVolumeSource {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Vddk { url, uuid, backing_file, secret, init_image } => {
                let mut vddk = json!({
                    "url": url,
                    "uuid": uuid,
                    "backingFile": backing_file,
                    "secretRef": secret,
                });
                if let Some(image) = init_image {
                    vddk["initImageURL"] = json!(image);
                }
                json!({ "vddk": vddk })
            }
            Self::Imageio { url, disk_id, secret } => {
                json!({ "imageio": { "url": url, "diskId": disk_id, "secretRef": secret } })
            }
            Self::Pvc { namespace, name } => json!({ "pvc": { "namespace": namespace, "name": name } }),
        }
    }
}

/// One warm transfer round, from the previous snapshot to the current one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Snapshot the previous round ended at, empty for the first round
    pub previous: String,
    /// Snapshot this round ends at
    pub current: String,
}

/// DataVolume of one disk; the generated claim carries the same name
pub fn build_data_volume(
    ctx: &VmContext<'_>,
    volume: &DiskVolume<'_>,
    name: &str,
    source: &DataVolumeSource,
    checkpoints: &[Checkpoint],
) -> Result<DynamicObject, ControllerError> {
    let destination = volume.destination;
    let mut storage = json!({
        "resources": { "requests": { "storage": requested_size(volume.disk.capacity).0 } },
    });
    if !destination.storage_class.is_empty() {
        storage["storageClassName"] = json!(destination.storage_class);
    }
    if let Some(mode) = destination.volume_mode {
        storage["volumeMode"] = json!(mode.as_str());
    }
    if let Some(mode) = destination.access_mode {
        storage["accessModes"] = json!([mode.as_str()]);
    }
    let mut spec = json!({ "source": source.to_json(), "storage": storage });
    if !checkpoints.is_empty() {
        spec["checkpoints"] = serde_json::to_value(checkpoints)?;
        spec["finalCheckpoint"] = json!(false);
    }
    let obj = json!({
        "apiVersion": "cdi.kubevirt.io/v1beta1",
        "kind": "DataVolume",
        "metadata": {
            "name": name,
            "namespace": ctx.namespace(),
            "labels": disk_labels(ctx, volume),
            "annotations": { SOURCE_DISK_ANNOTATION: volume.disk.id },
        },
        "spec": spec,
    });
    Ok(serde_json::from_value(obj)?)
}

/// Merge patch appending warm rounds to a DataVolume
pub fn checkpoint_patch(checkpoints: &[Checkpoint], final_checkpoint: bool) -> Result<serde_json::Value, ControllerError> {
    Ok(json!({
        "spec": {
            "checkpoints": serde_json::to_value(checkpoints)?,
            "finalCheckpoint": final_checkpoint,
        }
    }))
}

/// Observed state of a DataVolume
#[derive(Debug, Clone, PartialEq)]
pub struct DataVolumeState {
    /// CDI phase (`ImportInProgress`, `Paused`, `Succeeded`, `Failed`, ...)
    pub phase: String,
    /// Percent done, when CDI reports it
    pub percent: Option<f64>,
}

impl DataVolumeState {
    /// Import finished
    pub fn succeeded(&self) -> bool {
        self.phase == "Succeeded"
    }

    /// Import failed permanently
    pub fn failed(&self) -> bool {
        self.phase == "Failed"
    }

    /// Warm round finished and the importer waits for the next checkpoint
    pub fn paused(&self) -> bool {
        self.phase == "Paused"
    }
}

/// Read phase and progress (`"45.20%"`) of a DataVolume
pub fn data_volume_state(obj: &DynamicObject) -> DataVolumeState {
    let status = obj.data.get("status");
    let phase = status
        .and_then(|s| s.get("phase"))
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string();
    let percent = status
        .and_then(|s| s.get("progress"))
        .and_then(|p| p.as_str())
        .and_then(|p| p.trim_end_matches('%').parse::<f64>().ok());
    DataVolumeState { phase, percent }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::mapping::SourceStorage;
    use crds::{ProviderSpec, SourceRef, VolumeMode};

    fn disk() -> SourceDisk {
        SourceDisk {
            id: "disk-1".into(),
            storage: SourceStorage { source: SourceRef::by_id("sd-1"), name: "data".into() },
            capacity: 10 * MIB + 1,
            file: "[ds1] web/web.vmdk".into(),
            shared: false,
        }
    }

    fn provider(type_: ProviderType) -> Provider {
        Provider::new("src", ProviderSpec {
            type_,
            url: "https://engine.example.com/ovirt-engine/api".into(),
            secret: None,
            settings: BTreeMap::from([(settings::REGION.to_string(), "eu-west-1".to_string())]),
        })
    }

    #[test]
    fn test_populator_kind() {
        let plain = StorageDestination { storage_class: "standard".into(), ..Default::default() };
        assert_eq!(populator_kind(ProviderType::OVirt, &plain), Some(PopulatorKind::Ovirt));
        assert_eq!(populator_kind(ProviderType::VSphere, &plain), None);
        let xcopy = StorageDestination { offload_vendor: Some("vantara".into()), ..plain.clone() };
        assert_eq!(populator_kind(ProviderType::VSphere, &xcopy), Some(PopulatorKind::VSphereXcopy));
        let plugin = StorageDestination { offload_plugin: Some("quay.io/x/plugin".into()), ..plain };
        assert_eq!(populator_kind(ProviderType::VSphere, &plugin), Some(PopulatorKind::OffloadPlugin));
    }

    #[test]
    fn test_claim_with_populator_source() {
        let (plan, plan_vm, vm, disk) = (plan(), plan_vm(), vm_status(), disk());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "mig-uid-123" };
        let destination = StorageDestination {
            storage_class: "fast".into(),
            volume_mode: Some(VolumeMode::Block),
            ..Default::default()
        };
        let volume = DiskVolume { index: 0, disk: &disk, destination: &destination };
        let claim = build_claim(
            &ctx,
            &volume,
            &ClaimName::Prefix("web-01-disk-0-".into()),
            Some(data_source_ref(PopulatorKind::Ovirt, "mig-uid--vm-42-0")),
        );
        assert_eq!(claim.metadata.generate_name.as_deref(), Some("web-01-disk-0-"));
        assert!(claim.metadata.name.is_none());
        let labels = claim.metadata.labels.unwrap();
        assert_eq!(labels["migration"], "mig-uid-123");
        assert_eq!(labels["diskID"], "disk-1");
        let spec = claim.spec.unwrap();
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(spec.resources.unwrap().requests.unwrap()["storage"], Quantity("11Mi".into()));
        let source = spec.data_source_ref.unwrap();
        assert_eq!(source.api_group.as_deref(), Some("forklift.konveyor.io"));
        assert_eq!(source.kind, "OvirtVolumePopulator");
    }

    #[test]
    fn test_populator_objects() {
        let (plan, plan_vm, vm, disk) = (plan(), plan_vm(), vm_status(), disk());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "0123456789" };
        let destination = StorageDestination { storage_class: "fast".into(), ..Default::default() };
        let volume = DiskVolume { index: 0, disk: &disk, destination: &destination };
        let ovirt = provider(ProviderType::OVirt);
        let inputs = PopulatorInputs {
            provider: &ovirt,
            secret_name: "creds",
            vm_id: "vm-42",
            snapshots: &[],
            claim_name: "web-disk-0",
        };

        let obj = build_populator(&ctx, PopulatorKind::Ovirt, &volume, &inputs).unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("01234567-vm-42-0"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("target"));
        assert_eq!(obj.data["spec"]["engineSecretName"], "creds");
        assert_eq!(obj.data["spec"]["diskId"], "disk-1");

        // EC2 needs the snapshot of the disk
        let err = build_populator(&ctx, PopulatorKind::Ec2, &volume, &inputs).unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));
        let snapshots = [SnapshotRef { id: "snap-9".into(), disk_id: Some("disk-1".into()) }];
        let inputs = PopulatorInputs { snapshots: &snapshots, ..inputs };
        let obj = build_populator(&ctx, PopulatorKind::Ec2, &volume, &inputs).unwrap();
        assert_eq!(obj.data["spec"]["snapshotId"], "snap-9");
        assert_eq!(obj.data["spec"]["region"], "eu-west-1");
    }

    #[test]
    fn test_transfer_secret_adds_cdi_keys() {
        let (plan, plan_vm, vm) = (plan(), plan_vm(), vm_status());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "0123456789" };
        let data = SecretData::from([
            ("user".to_string(), "admin".to_string()),
            ("password".to_string(), "secret".to_string()),
        ]);
        let secret = build_transfer_secret(&ctx, &data);
        assert_eq!(secret.metadata.name.as_deref(), Some("01234567-vm-42-source"));
        let data = secret.data.unwrap();
        assert_eq!(data["accessKeyId"].0, b"admin");
        assert_eq!(data["secretKey"].0, b"secret");
        assert_eq!(data["user"].0, b"admin");
    }

    #[test]
    fn test_data_volume_and_state() {
        let (plan, plan_vm, vm, disk) = (plan(), plan_vm(), vm_status(), disk());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "0123456789" };
        let destination = StorageDestination { storage_class: "fast".into(), ..Default::default() };
        let volume = DiskVolume { index: 0, disk: &disk, destination: &destination };
        let source = DataVolumeSource::Imageio {
            url: "https://engine/api".into(),
            disk_id: "disk-1".into(),
            secret: "creds".into(),
        };
        let checkpoints = [Checkpoint { previous: String::new(), current: "snap-1".into() }];
        let mut dv = build_data_volume(&ctx, &volume, "web-disk-0", &source, &checkpoints).unwrap();
        assert_eq!(dv.data["spec"]["source"]["imageio"]["diskId"], "disk-1");
        assert_eq!(dv.data["spec"]["checkpoints"][0]["current"], "snap-1");
        assert_eq!(dv.data["spec"]["finalCheckpoint"], false);
        assert_eq!(dv.data["spec"]["storage"]["storageClassName"], "fast");

        dv.data["status"] = json!({ "phase": "Paused", "progress": "45.5%" });
        let state = data_volume_state(&dv);
        assert!(state.paused());
        assert_eq!(state.percent, Some(45.5));

        let patch = checkpoint_patch(&checkpoints, true).unwrap();
        assert_eq!(patch["spec"]["finalCheckpoint"], true);
    }
}
