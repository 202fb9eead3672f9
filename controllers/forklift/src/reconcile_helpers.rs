//! Helper functions for common reconciliation patterns
//!
//! Status writes, object references and label selectors shared by every reconciler.

use crate::error::ControllerError;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Key used for logs and the backoff table: `Kind/namespace/name`
pub fn object_key<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Reference to an object, used to attach events
pub fn object_reference<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    obj.object_ref(&())
}

/// Owner reference to `obj` (never the controller, so that other owners may coexist)
pub fn owner_reference<K>(obj: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.meta().name.clone()?,
        uid: obj.meta().uid.clone()?,
        block_owner_deletion: Some(true),
        controller: None,
    })
}

/// Render labels as a selector string (`a=b,c=d`), sorted by key
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge patch replacing `status`, guarded by the resource version the status was computed from.
///
/// The API server rejects the patch with 409 when the object moved on in between.
pub fn status_patch<S: Serialize>(status: &S, resource_version: Option<&str>) -> Result<serde_json::Value, ControllerError> {
    let mut patch = serde_json::json!({ "status": serde_json::to_value(status)? });
    if let Some(version) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": version });
    }
    Ok(patch)
}

/// True when the desired status differs from what is stored
pub fn status_needs_update<S: PartialEq>(current: Option<&S>, desired: &S) -> bool {
    current != Some(desired)
}

/// Result of a compare-and-set status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// Stored status already matched
    Unchanged,
    /// Patch applied
    Written,
    /// Object changed since it was read; reconcile again
    Conflict,
}

/// Write `desired` as the status of `obj` when it differs from the stored one.
///
/// The write carries the object's resource version, so a concurrent change turns into
/// [`StatusWrite::Conflict`] rather than a lost update.
pub async fn update_status_if_changed<K, S>(
    api: &Api<K>,
    obj: &K,
    current: Option<&S>,
    desired: &S,
) -> Result<StatusWrite, ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    S: Serialize + PartialEq,
{
    if !status_needs_update(current, desired) {
        debug!("{} already has the desired status, skipping update", object_key(obj));
        return Ok(StatusWrite::Unchanged);
    }
    let patch = status_patch(desired, obj.meta().resource_version.as_deref())?;
    match api
        .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            debug!("Updated status of {}", object_key(obj));
            Ok(StatusWrite::Written)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!("Status of {} changed concurrently, retrying", object_key(obj));
            Ok(StatusWrite::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

/// Merge two label maps, `extra` winning on conflicts
pub fn merge_labels(base: &BTreeMap<String, String>, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod reconcile_helpers_test;
