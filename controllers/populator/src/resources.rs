//! Scratch objects created for a pending claim: the prime claim and the populator pod.

use crate::populator::{PopulatorSource, WorkerTarget};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use std::collections::BTreeMap;

/// Device path of a block-mode prime volume inside the pod
pub const BLOCK_DEVICE_PATH: &str = "/dev/block";
/// Mount point of a filesystem-mode prime volume inside the pod
pub const FILESYSTEM_MOUNT_PATH: &str = "/mnt";
/// Disk image written on a filesystem-mode prime volume
pub const FILESYSTEM_IMAGE_PATH: &str = "/mnt/disk.img";

const VOLUME_NAME: &str = "target";
const CONTAINER_NAME: &str = "populate";
const POPULATOR_LABEL: &str = "populator.forklift.konveyor.io/claim";

/// Name of the prime claim for a claim UID
pub fn prime_claim_name(claim_uid: &str) -> String {
    format!("prime-{}", claim_uid)
}

/// Name of the populator pod for a claim UID
pub fn pod_name(claim_uid: &str) -> String {
    format!("populate-{}", claim_uid)
}

/// True when the claim asks for a raw block volume
pub fn is_block(claim: &corev1::PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .is_some_and(|mode| mode == "Block")
}

/// Path the worker writes to
pub fn volume_path(block: bool) -> &'static str {
    if block { BLOCK_DEVICE_PATH } else { FILESYSTEM_IMAGE_PATH }
}

fn labels(claim_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(POPULATOR_LABEL.to_string(), claim_uid.to_string())])
}

/// Prime claim mirroring the class, size, volume mode and access modes of `claim`
pub fn build_prime_claim(
    claim: &corev1::PersistentVolumeClaim,
    claim_uid: &str,
    owner: metav1::OwnerReference,
) -> corev1::PersistentVolumeClaim {
    let spec = claim.spec.clone().unwrap_or_default();
    corev1::PersistentVolumeClaim {
        metadata: metav1::ObjectMeta {
            name: Some(prime_claim_name(claim_uid)),
            namespace: claim.metadata.namespace.clone(),
            labels: Some(labels(claim_uid)),
            owner_references: Some(vec![owner]),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PersistentVolumeClaimSpec {
            access_modes: spec.access_modes,
            resources: spec.resources,
            storage_class_name: spec.storage_class_name,
            volume_mode: spec.volume_mode,
            ..corev1::PersistentVolumeClaimSpec::default()
        }),
        ..corev1::PersistentVolumeClaim::default()
    }
}

/// Pod streaming the source disk into the prime claim
pub fn build_populator_pod(
    claim: &corev1::PersistentVolumeClaim,
    claim_uid: &str,
    source: &PopulatorSource,
    image: &str,
    cr_name: &str,
    owner: metav1::OwnerReference,
) -> corev1::Pod {
    let namespace = claim.metadata.namespace.clone().unwrap_or_default();
    let block = is_block(claim);
    let target = WorkerTarget {
        cr_name,
        cr_namespace: &namespace,
        volume_path: volume_path(block),
        claim_name: claim.metadata.name.as_deref().unwrap_or_default(),
    };

    let mut container = corev1::Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(source.args(&target)),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..corev1::Container::default()
    };
    if !source.secret_name().is_empty() {
        container.env_from = Some(vec![corev1::EnvFromSource {
            secret_ref: Some(corev1::SecretEnvSource {
                name: source.secret_name().to_string(),
                optional: Some(false),
            }),
            ..corev1::EnvFromSource::default()
        }]);
    }
    if block {
        container.volume_devices = Some(vec![corev1::VolumeDevice {
            name: VOLUME_NAME.to_string(),
            device_path: BLOCK_DEVICE_PATH.to_string(),
        }]);
    } else {
        container.volume_mounts = Some(vec![corev1::VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: FILESYSTEM_MOUNT_PATH.to_string(),
            ..corev1::VolumeMount::default()
        }]);
    }

    corev1::Pod {
        metadata: metav1::ObjectMeta {
            name: Some(pod_name(claim_uid)),
            namespace: Some(namespace),
            labels: Some(labels(claim_uid)),
            owner_references: Some(vec![owner]),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            volumes: Some(vec![corev1::Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
                    claim_name: prime_claim_name(claim_uid),
                    read_only: Some(false),
                }),
                ..corev1::Volume::default()
            }]),
            ..corev1::PodSpec::default()
        }),
        ..corev1::Pod::default()
    }
}

/// Owner reference pointing at a populator object
pub fn owner_reference(kind: &str, name: &str, uid: &str) -> metav1::OwnerReference {
    metav1::OwnerReference {
        api_version: format!("{}/{}", crds::GROUP, crds::VERSION),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// `claimRef` patch moving a volume from the prime claim to the original claim
pub fn rebind_patch(claim: &corev1::PersistentVolumeClaim) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "claimRef": {
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "namespace": claim.metadata.namespace,
                "name": claim.metadata.name,
                "uid": claim.metadata.uid,
                "resourceVersion": claim.metadata.resource_version,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::OvirtVolumePopulatorSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn claim(volume_mode: &str) -> corev1::PersistentVolumeClaim {
        corev1::PersistentVolumeClaim {
            metadata: metav1::ObjectMeta {
                name: Some("web-disk-0".to_string()),
                namespace: Some("target".to_string()),
                uid: Some("1234".to_string()),
                resource_version: Some("77".to_string()),
                ..metav1::ObjectMeta::default()
            },
            spec: Some(corev1::PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some("ceph-rbd".to_string()),
                volume_mode: Some(volume_mode.to_string()),
                resources: Some(corev1::VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity("10Gi".to_string()))])),
                    ..corev1::VolumeResourceRequirements::default()
                }),
                data_source_ref: Some(corev1::TypedObjectReference {
                    api_group: Some(crds::GROUP.to_string()),
                    kind: "OvirtVolumePopulator".to_string(),
                    name: "web-disk-0".to_string(),
                    namespace: None,
                }),
                ..corev1::PersistentVolumeClaimSpec::default()
            }),
            ..corev1::PersistentVolumeClaim::default()
        }
    }

    fn source() -> PopulatorSource {
        PopulatorSource::Ovirt(OvirtVolumePopulatorSpec {
            engine_url: "https://engine".to_string(),
            engine_secret_name: "creds".to_string(),
            disk_id: "d-1".to_string(),
        })
    }

    fn owner() -> metav1::OwnerReference {
        owner_reference("OvirtVolumePopulator", "web-disk-0", "cr-uid")
    }

    #[test]
    fn test_prime_claim_mirrors_original() {
        let original = claim("Block");
        let prime = build_prime_claim(&original, "1234", owner());
        assert_eq!(prime.metadata.name.as_deref(), Some("prime-1234"));
        assert_eq!(prime.metadata.namespace.as_deref(), Some("target"));
        let spec = prime.spec.unwrap();
        let original_spec = original.spec.unwrap();
        assert_eq!(spec.storage_class_name, original_spec.storage_class_name);
        assert_eq!(spec.volume_mode, original_spec.volume_mode);
        assert_eq!(spec.access_modes, original_spec.access_modes);
        assert_eq!(spec.resources, original_spec.resources);
        assert!(spec.data_source_ref.is_none());
        assert_eq!(prime.metadata.owner_references.unwrap()[0].uid, "cr-uid");
    }

    #[test]
    fn test_block_pod_uses_device() {
        let pod = build_populator_pod(&claim("Block"), "1234", &source(), "img", "web-disk-0", owner());
        assert_eq!(pod.metadata.name.as_deref(), Some("populate-1234"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.volume_devices.as_ref().unwrap()[0].device_path, "/dev/block");
        assert!(container.volume_mounts.is_none());
        let args = container.args.as_ref().unwrap();
        assert!(args.contains(&"--volume-path=/dev/block".to_string()));
        assert!(args.contains(&"--cr-namespace=target".to_string()));
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(env_from[0].secret_ref.as_ref().unwrap().name, "creds");
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(volume.persistent_volume_claim.as_ref().unwrap().claim_name, "prime-1234");
    }

    #[test]
    fn test_filesystem_pod_writes_image() {
        let pod = build_populator_pod(&claim("Filesystem"), "1234", &source(), "img", "web-disk-0", owner());
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/mnt");
        assert!(container.args.as_ref().unwrap().contains(&"--volume-path=/mnt/disk.img".to_string()));
    }

    #[test]
    fn test_rebind_patch_targets_original_claim() {
        let patch = rebind_patch(&claim("Block"));
        assert_eq!(patch["spec"]["claimRef"]["name"], "web-disk-0");
        assert_eq!(patch["spec"]["claimRef"]["uid"], "1234");
        assert_eq!(patch["spec"]["claimRef"]["namespace"], "target");
    }
}
