//! Hook job and the ConfigMap carrying its playbook and inputs.

use super::{RunOutcome, VmContext};
use crate::adapter::decode_base64;
use crate::error::ControllerError;
use crds::{labels, Hook, HookStep};
use k8s_openapi::api::batch::v1 as batchv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Where the ConfigMap is mounted in the hook container
pub const HOOK_MOUNT_PATH: &str = "/tmp/hook";

/// Inputs of one hook run
#[derive(Debug, Clone)]
pub struct HookRun<'a> {
    /// The hook
    pub hook: &'a Hook,
    /// Pre or post
    pub step: HookStep,
    /// Migration record of the VM, handed to the playbook as `workload.yml`
    pub workload: &'a serde_json::Value,
    /// Job retries
    pub backoff_limit: i32,
}

fn role(step: HookStep) -> String {
    step.as_str().to_lowercase()
}

fn hook_labels(ctx: &VmContext<'_>, step: HookStep) -> BTreeMap<String, String> {
    let mut out = ctx.labels();
    out.insert(labels::STEP.to_string(), role(step));
    out
}

/// Name shared by the job and its ConfigMap
pub fn hook_object_name(ctx: &VmContext<'_>, step: HookStep) -> String {
    ctx.role_name(&role(step))
}

/// Decoded playbook of a hook, `None` when the hook runs its image without one
pub fn playbook(hook: &Hook) -> Result<Option<String>, ControllerError> {
    let Some(encoded) = hook.spec.playbook.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Ok(None);
    };
    let bytes = decode_base64(encoded)
        .ok_or_else(|| ControllerError::Validation(format!("playbook of hook '{}' is not base64", hook.name_any())))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| ControllerError::Validation(format!("playbook of hook '{}' is not UTF-8", hook.name_any())))
}

/// ConfigMap with `playbook.yml`, `plan.yml` and `workload.yml`
pub fn build_hook_config_map(ctx: &VmContext<'_>, run: &HookRun<'_>) -> Result<corev1::ConfigMap, ControllerError> {
    let mut data = BTreeMap::from([
        ("plan.yml".to_string(), serde_yaml::to_string(ctx.plan)?),
        ("workload.yml".to_string(), serde_yaml::to_string(run.workload)?),
    ]);
    if let Some(playbook) = playbook(run.hook)? {
        data.insert("playbook.yml".to_string(), playbook);
    }
    Ok(corev1::ConfigMap {
        metadata: metav1::ObjectMeta {
            name: Some(hook_object_name(ctx, run.step)),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(hook_labels(ctx, run.step)),
            ..metav1::ObjectMeta::default()
        },
        data: Some(data),
        ..corev1::ConfigMap::default()
    })
}

/// Job running the hook image with the ConfigMap mounted
pub fn build_hook_job(ctx: &VmContext<'_>, run: &HookRun<'_>) -> batchv1::Job {
    let name = hook_object_name(ctx, run.step);
    let labels = hook_labels(ctx, run.step);
    batchv1::Job {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(labels.clone()),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(batchv1::JobSpec {
            backoff_limit: Some(run.backoff_limit),
            active_deadline_seconds: run.hook.spec.deadline.filter(|d| *d > 0),
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: run.hook.spec.service_account.clone(),
                    containers: vec![corev1::Container {
                        name: "hook".to_string(),
                        image: Some(run.hook.spec.image.clone()),
                        volume_mounts: Some(vec![corev1::VolumeMount {
                            name: "hook".to_string(),
                            mount_path: HOOK_MOUNT_PATH.to_string(),
                            ..corev1::VolumeMount::default()
                        }]),
                        ..corev1::Container::default()
                    }],
                    volumes: Some(vec![corev1::Volume {
                        name: "hook".to_string(),
                        config_map: Some(corev1::ConfigMapVolumeSource {
                            name: name.clone(),
                            ..corev1::ConfigMapVolumeSource::default()
                        }),
                        ..corev1::Volume::default()
                    }]),
                    ..corev1::PodSpec::default()
                }),
            },
            ..batchv1::JobSpec::default()
        }),
        ..batchv1::Job::default()
    }
}

/// Outcome of a hook job, from its `Complete`/`Failed` conditions
pub fn job_outcome(job: &batchv1::Job) -> RunOutcome {
    let conditions = job.status.as_ref().and_then(|s| s.conditions.as_ref());
    for condition in conditions.into_iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return RunOutcome::Succeeded,
            "Failed" => {
                let reason = condition.message.clone().or_else(|| condition.reason.clone());
                return RunOutcome::Failed(reason.unwrap_or_else(|| "hook job failed".to_string()));
            }
            _ => {}
        }
    }
    RunOutcome::Running
}
