//! Destination cluster access.
//!
//! Migration objects (claims, populators, DataVolumes, conversion pods, hook jobs and the
//! KubeVirt VM) are created through [`TargetCluster`] so the engine can be driven against an
//! in-memory cluster in tests. Objects travel as `DynamicObject`; typed k8s-openapi objects
//! convert with [`to_dynamic`]/[`from_dynamic`].

use crate::adapter::SecretData;
use crate::error::ControllerError;
use async_trait::async_trait;
use base64::Engine;
use crds::PopulatorKind;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

/// Kinds of object the migration engine manages on the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchKind {
    /// PersistentVolumeClaim
    Pvc,
    /// Pod (conversion)
    Pod,
    /// batch Job (hooks)
    Job,
    /// ConfigMap (hook playbook and inputs)
    ConfigMap,
    /// Secret (source credentials copied next to the transfer)
    Secret,
    /// CDI DataVolume
    DataVolume,
    /// KubeVirt VirtualMachine
    VirtualMachine,
    /// One of the volume populator kinds
    Populator(PopulatorKind),
}

impl ScratchKind {
    /// API coordinates
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Pvc => core("PersistentVolumeClaim", "persistentvolumeclaims"),
            Self::Pod => core("Pod", "pods"),
            Self::ConfigMap => core("ConfigMap", "configmaps"),
            Self::Secret => core("Secret", "secrets"),
            Self::Job => ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("batch", "v1", "Job"), "jobs"),
            Self::DataVolume => data_volume_resource(),
            Self::VirtualMachine => virtual_machine_resource(),
            Self::Populator(kind) => {
                ApiResource::from_gvk(&GroupVersionKind::gvk(crds::GROUP, crds::VERSION, kind.kind()))
            }
        }
    }

    /// Kubernetes kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pvc => "PersistentVolumeClaim",
            Self::Pod => "Pod",
            Self::Job => "Job",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::DataVolume => "DataVolume",
            Self::VirtualMachine => "VirtualMachine",
            Self::Populator(kind) => kind.kind(),
        }
    }
}

fn core(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", kind), plural)
}

/// `kubevirt.io/v1` VirtualMachine
pub fn virtual_machine_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"), "virtualmachines")
}

/// `cdi.kubevirt.io/v1beta1` DataVolume
pub fn data_volume_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "DataVolume"), "datavolumes")
}

/// Convert a typed object to a dynamic one
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object back to a typed one
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Object store on the destination cluster
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Create `obj` unless an object with its name exists; returns the stored object
    async fn apply(&self, kind: ScratchKind, namespace: &str, obj: DynamicObject) -> Result<DynamicObject, ControllerError>;

    /// Fetch one object
    async fn get(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ControllerError>;

    /// Objects matching a label selector
    async fn list(&self, kind: ScratchKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>, ControllerError>;

    /// Delete one object; false when it was already gone
    async fn delete(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<bool, ControllerError>;

    /// Merge-patch one object
    async fn patch(&self, kind: ScratchKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<(), ControllerError>;
}

/// [`TargetCluster`] backed by the API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ScratchKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl TargetCluster for KubeCluster {
    async fn apply(&self, kind: ScratchKind, namespace: &str, obj: DynamicObject) -> Result<DynamicObject, ControllerError> {
        let api = self.api(kind, namespace);
        match api.create(&PostParams::default(), &obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let name = obj.metadata.name.clone().unwrap_or_default();
                Ok(api.get(&name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ControllerError> {
        Ok(self.api(kind, namespace).get_opt(name).await?)
    }

    async fn list(&self, kind: ScratchKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>, ControllerError> {
        let params = ListParams::default().labels(selector);
        Ok(self.api(kind, namespace).list(&params).await?.items)
    }

    async fn delete(&self, kind: ScratchKind, namespace: &str, name: &str) -> Result<bool, ControllerError> {
        match self.api(kind, namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(&self, kind: ScratchKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<(), ControllerError> {
        self.api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Kubeconfig for a remote cluster reached with a bearer token
pub fn remote_kubeconfig(url: &str, secret: &SecretData) -> Result<Kubeconfig, ControllerError> {
    let token = secret
        .get("token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ControllerError::Validation("secret key 'token' is missing".to_string()))?;
    let mut cluster = json!({ "server": url });
    if secret.get("insecureSkipVerify").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        cluster["insecure-skip-tls-verify"] = json!(true);
    } else if let Some(ca) = secret.get("cacert").filter(|c| !c.is_empty()) {
        cluster["certificate-authority-data"] = json!(base64::engine::general_purpose::STANDARD.encode(ca));
    }
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "remote", "cluster": cluster }],
        "users": [{ "name": "remote", "user": { "token": token } }],
        "contexts": [{ "name": "remote", "context": { "cluster": "remote", "user": "remote" } }],
        "current-context": "remote",
    }))?)
}

/// Client for a remote cluster described by a provider URL and token secret
pub async fn remote_client(url: &str, secret: &SecretData) -> Result<Client, ControllerError> {
    let kubeconfig = remote_kubeconfig(url, secret)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("remote cluster {}: {}", url, e)))?;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::ResourceExt;

    #[test]
    fn test_api_resources() {
        assert_eq!(ScratchKind::Pvc.api_resource().plural, "persistentvolumeclaims");
        assert_eq!(ScratchKind::Job.api_resource().api_version, "batch/v1");
        assert_eq!(ScratchKind::DataVolume.api_resource().group, "cdi.kubevirt.io");
        let populator = ScratchKind::Populator(PopulatorKind::Ec2).api_resource();
        assert_eq!(populator.kind, "Ec2VolumePopulator");
        assert_eq!(populator.api_version, "forklift.konveyor.io/v1beta1");
    }

    #[test]
    fn test_dynamic_conversion_keeps_type() {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some("disk-0".to_string());
        let dynamic = to_dynamic(&pvc).unwrap();
        assert_eq!(dynamic.name_any(), "disk-0");
        assert_eq!(dynamic.types.as_ref().map(|t| t.kind.as_str()), Some("PersistentVolumeClaim"));
        let back: PersistentVolumeClaim = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("disk-0"));
    }

    #[test]
    fn test_remote_kubeconfig() {
        let secret = SecretData::from([
            ("token".to_string(), "sha256~abc".to_string()),
            ("insecureSkipVerify".to_string(), "true".to_string()),
        ]);
        let config = remote_kubeconfig("https://api.remote:6443", &secret).unwrap();
        assert_eq!(config.current_context.as_deref(), Some("remote"));
        let cluster = config.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://api.remote:6443"));
        assert_eq!(cluster.insecure_skip_tls_verify, Some(true));
        assert!(remote_kubeconfig("https://x", &SecretData::new()).is_err());
    }
}
