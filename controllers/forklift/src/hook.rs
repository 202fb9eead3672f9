//! Hook reconciliation.
//!
//! Only the hook definition is checked here. The Job and ConfigMap that run a hook for a VM
//! are built by `builder::hook` and scheduled by the PreHook and PostHook pipeline steps.

use crate::builder::hook::playbook;
use crate::error::ControllerError;
use crate::reconcile_helpers::object_key;
use crate::reconciler::Reconciler;
use chrono::Utc;
use crds::{merge_conditions, Condition, Hook, HookStatus};
use kube::Resource;
use kube_runtime::controller::Action;
use tracing::{debug, info};

/// Condition types written by the hook controller
pub mod conditions {
    pub const IMAGE_NOT_VALID: &str = "ImageNotValid";
    pub const PLAYBOOK_NOT_VALID: &str = "PlaybookNotValid";
}

fn is_path_component(s: &str) -> bool {
    let bytes = s.as_bytes();
    !s.is_empty()
        && bytes.first().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && bytes.last().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_tag(s: &str) -> bool {
    s.len() <= 128
        && s.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_digest(s: &str) -> bool {
    match s.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'+' | b'.' | b'_' | b'-'))
                && hex.len() >= 32
                && hex.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

fn is_registry(s: &str) -> bool {
    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (s, None),
    };
    !host.is_empty()
        && host.split('.').all(|label| !label.is_empty() && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'))
        && port.is_none_or(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// True for `[registry[:port]/]path[:tag][@digest]` container image references
pub fn is_image_reference(image: &str) -> bool {
    let (rest, digest) = match image.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (image, None),
    };
    if digest.is_some_and(|d| !is_digest(d)) {
        return false;
    }
    let (name, tag) = match rest.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (rest, None),
    };
    if tag.is_some_and(|t| !is_tag(t)) {
        return false;
    }
    let mut components: Vec<&str> = name.split('/').collect();
    // The first component is a registry when it looks like a host
    if components.len() > 1 && components.first().is_some_and(|c| c.contains(['.', ':']) || *c == "localhost") {
        let registry = components.remove(0);
        if !is_registry(registry) {
            return false;
        }
    }
    components.iter().all(|c| is_path_component(c))
}

/// Conditions of a hook definition
pub fn validate_hook(hook: &Hook) -> Vec<Condition> {
    let mut out = Vec::new();
    let image = hook.spec.image.trim();
    if image.is_empty() {
        out.push(Condition::critical(conditions::IMAGE_NOT_VALID, "NotSet", "Image not specified."));
    } else if !is_image_reference(image) {
        out.push(Condition::critical(
            conditions::IMAGE_NOT_VALID,
            "NotValid",
            format!("Image '{}' is not a valid container image reference.", image),
        ));
    }
    match playbook(hook) {
        Ok(Some(text)) => {
            if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(&text) {
                out.push(Condition::critical(
                    conditions::PLAYBOOK_NOT_VALID,
                    "NotValid",
                    format!("Playbook is not valid YAML: {}", e),
                ));
            }
        }
        Ok(None) => {}
        Err(e) => out.push(Condition::critical(conditions::PLAYBOOK_NOT_VALID, "NotValid", e.to_string())),
    }
    if out.is_empty() {
        out.push(Condition::ready("The hook is ready."));
    }
    out
}

/// Status to store for `desired` conditions
pub fn hook_status(hook: &Hook, desired: Vec<Condition>) -> HookStatus {
    let current = hook.status.clone().unwrap_or_default();
    HookStatus {
        conditions: merge_conditions(&current.conditions, desired, &[], Utc::now()),
        observed_generation: hook.meta().generation,
    }
}

impl Reconciler {
    /// Reconciles a Hook.
    pub async fn reconcile_hook(&self, hook: &Hook) -> Result<Action, ControllerError> {
        let key = object_key(hook);
        info!("Reconciling {}", key);
        let status = hook_status(hook, validate_hook(hook));
        let outcome = self.write_status(hook, hook.status.as_ref(), &status).await?;
        debug!("{} status: {:?}", key, outcome);
        self.reconciled(&key);
        Ok(Action::await_change())
    }
}
