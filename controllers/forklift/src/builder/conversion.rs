//! virt-v2v conversion pod.
//!
//! The same pod serves two steps: DiskTransferV2v copies the source disks into the target
//! claims and converts them, GuestConversion converts disks another step already transferred
//! (`V2V_inPlace`).

use super::{RunOutcome, VmContext};
use crate::error::ControllerError;
use crds::{labels, Provider, ProviderType};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

/// Uid and gid of the qemu user the conversion runs as
pub const QEMU_ID: i64 = 107;

/// Mount point of the OVA export inside the conversion pod
pub const OVA_MOUNT_PATH: &str = "/ova";

const CONTAINER_NAME: &str = "virt-v2v";
const SUBAPP: &str = "virt-v2v";

/// A target claim attached to the conversion pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedClaim {
    /// Claim name
    pub name: String,
    /// Raw block volume
    pub block: bool,
}

/// Conversion pod inputs beyond the VM identity
#[derive(Debug, Clone)]
pub struct ConversionInputs<'a> {
    /// Source provider
    pub provider: &'a Provider,
    /// virt-v2v image
    pub image: &'a str,
    /// Copied source credentials, empty for providers without any
    pub secret_name: &'a str,
    /// Target claims in disk order
    pub claims: &'a [AttachedClaim],
    /// Disks are already on the claims
    pub in_place: bool,
    /// Source disk files (OVA members, VMDK paths)
    pub disk_files: &'a [String],
}

/// Device path of the n-th block claim
pub fn device_path(index: usize) -> String {
    format!("/dev/block{}", index)
}

/// Mount point of the n-th filesystem claim
pub fn mount_path(index: usize) -> String {
    format!("/mnt/disks/disk{}", index)
}

/// Split an NFS URL `host:/exported/path` into server and path
pub fn nfs_export(url: &str) -> Result<(&str, &str), ControllerError> {
    match url.split_once(':') {
        Some((server, path)) if !server.is_empty() && path.starts_with('/') => Ok((server, path)),
        _ => Err(ControllerError::Validation(format!(
            "invalid NFS export '{}': expected host:/path",
            url
        ))),
    }
}

fn env(name: &str, value: impl Into<String>) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..corev1::EnvVar::default()
    }
}

/// Conversion pod of one VM
pub fn build_conversion_pod(ctx: &VmContext<'_>, inputs: &ConversionInputs<'_>) -> Result<corev1::Pod, ControllerError> {
    let provider_type = inputs.provider.spec.type_;
    let mut vars = vec![
        env("V2V_vmName", ctx.vm.name.clone()),
        env("V2V_source", provider_type.as_str()),
        env("V2V_NewName", ctx.target_name()),
    ];
    if inputs.in_place {
        vars.push(env("V2V_inPlace", "1"));
    }
    if provider_type == ProviderType::VSphere {
        vars.push(env("V2V_libvirtURL", inputs.provider.spec.url.clone()));
    }
    if !inputs.disk_files.is_empty() {
        vars.push(env("V2V_diskPath", inputs.disk_files.join(",")));
    }
    if let Some(root) = ctx.plan_vm.root_disk_index {
        vars.push(env("V2V_RootDisk", root.to_string()));
    }
    if ctx.plan.spec.preserve_static_ips {
        vars.push(env("V2V_StaticIPs", "true"));
    }

    let mut volumes = Vec::new();
    let mut devices = Vec::new();
    let mut mounts = Vec::new();
    for (index, claim) in inputs.claims.iter().enumerate() {
        let volume_name = format!("disk{}", index);
        volumes.push(corev1::Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
                claim_name: claim.name.clone(),
                read_only: Some(false),
            }),
            ..corev1::Volume::default()
        });
        if claim.block {
            devices.push(corev1::VolumeDevice { name: volume_name, device_path: device_path(index) });
        } else {
            mounts.push(corev1::VolumeMount {
                name: volume_name,
                mount_path: mount_path(index),
                ..corev1::VolumeMount::default()
            });
        }
    }
    if provider_type == ProviderType::Ova {
        let (server, path) = nfs_export(&inputs.provider.spec.url)?;
        volumes.push(corev1::Volume {
            name: "ova".to_string(),
            nfs: Some(corev1::NFSVolumeSource {
                server: server.to_string(),
                path: path.to_string(),
                read_only: Some(true),
            }),
            ..corev1::Volume::default()
        });
        mounts.push(corev1::VolumeMount {
            name: "ova".to_string(),
            mount_path: OVA_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..corev1::VolumeMount::default()
        });
    }

    let mut pod_labels = ctx.labels();
    pod_labels.insert(labels::APP.to_string(), super::APP.to_string());
    pod_labels.insert(labels::SUBAPP.to_string(), SUBAPP.to_string());

    let env_from = (!inputs.secret_name.is_empty()).then(|| {
        vec![corev1::EnvFromSource {
            secret_ref: Some(corev1::SecretEnvSource {
                name: inputs.secret_name.to_string(),
                optional: Some(false),
            }),
            ..corev1::EnvFromSource::default()
        }]
    });

    Ok(corev1::Pod {
        metadata: metav1::ObjectMeta {
            name: Some(ctx.role_name("v2v")),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(pod_labels),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PodSpec {
            restart_policy: Some("Never".to_string()),
            security_context: Some(corev1::PodSecurityContext {
                run_as_user: Some(QEMU_ID),
                run_as_group: Some(QEMU_ID),
                fs_group: Some(QEMU_ID),
                run_as_non_root: Some(true),
                ..corev1::PodSecurityContext::default()
            }),
            node_selector: Some(ctx.plan.spec.target_node_selector.clone()).filter(|s| !s.is_empty()),
            containers: vec![corev1::Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(inputs.image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(vars),
                env_from,
                volume_devices: Some(devices).filter(|d| !d.is_empty()),
                volume_mounts: Some(mounts).filter(|m| !m.is_empty()),
                termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                ..corev1::Container::default()
            }],
            volumes: Some(volumes),
            ..corev1::PodSpec::default()
        }),
        ..corev1::Pod::default()
    })
}

/// Outcome of a run-to-completion pod
pub fn pod_outcome(pod: &corev1::Pod) -> RunOutcome {
    let Some(status) = pod.status.as_ref() else {
        return RunOutcome::Running;
    };
    match status.phase.as_deref() {
        Some("Succeeded") => RunOutcome::Succeeded,
        Some("Failed") => {
            let terminated = status
                .container_statuses
                .iter()
                .flatten()
                .find_map(|c| c.state.as_ref().and_then(|s| s.terminated.as_ref()));
            let message = terminated
                .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
                .or_else(|| status.message.clone())
                .unwrap_or_else(|| "conversion pod failed".to_string());
            RunOutcome::Failed(message.trim().to_string())
        }
        _ => RunOutcome::Running,
    }
}
