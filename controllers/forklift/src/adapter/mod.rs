//! Source hypervisor adapters.
//!
//! The only operations the controller performs against a source: test the credentials, read
//! and change the power state, and create/remove the snapshots a migration needs. One adapter
//! per provider family, picked by [`new_adapter`]:
//!
//! | Family | Transport | Snapshots |
//! |--------|-----------|-----------|
//! | vsphere | vSphere Web Services (SOAP) | VM snapshot |
//! | ovirt | REST (JSON) | VM snapshot |
//! | openstack | Keystone + Nova + Cinder | volume upload to image |
//! | ec2 | EC2 query API | EBS snapshot per volume |
//! | ova | none, always powered off | none |
//! | hyperv | inventory only, must be off | none |
//! | openshift | KubeVirt `runStrategy` | none |

pub mod ec2;
pub mod hyperv;
pub mod openshift;
pub mod openstack;
pub mod ova;
pub mod ovirt;
pub mod vsphere;

use crate::error::ControllerError;
use async_trait::async_trait;
use base64::Engine;
use crds::{PowerState, Provider, ProviderType, SnapshotRef};
use inventory_client::InventoryClientTrait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by source adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The source object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The source API answered with an error
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Message or fault string
        message: String,
    },

    /// Unexpected response shape
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Secret is missing keys or has invalid values
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    /// Operation not available for this source family
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The VM must be powered off by its owner before migration
    #[error("VM {0} is running and cannot be powered off by the controller")]
    MustBeOff(String),

    /// EC2 API error
    #[error("EC2 error: {0}")]
    Ec2(#[from] ec2_client::Ec2Error),

    /// Kubernetes error (KubeVirt sources)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl AdapterError {
    /// Errors worth retrying quietly
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Ec2(e) => e.is_transient(),
            Self::Kube(kube::Error::Api(response)) => response.code == 429 || response.code >= 500,
            Self::Kube(_) => true,
            _ => false,
        }
    }

    /// Map a non-success HTTP status to an adapter error
    pub fn from_status(status: reqwest::StatusCode, what: &str, body: &str) -> Self {
        let message = format!("{}: {}", what, body.chars().take(300).collect::<String>());
        match status.as_u16() {
            401 | 403 => Self::Authentication(message),
            404 => Self::NotFound(what.to_string()),
            code => Self::Api { status: code, message },
        }
    }
}

/// Decoded credential secret
pub type SecretData = BTreeMap<String, String>;

/// Decode every key of a Secret (`data` is base64, `stringData` is plain)
pub fn secret_data(secret: &Secret) -> SecretData {
    let mut out = SecretData::new();
    for (key, value) in secret.data.iter().flatten() {
        out.insert(key.clone(), String::from_utf8_lossy(&value.0).trim_end_matches('\n').to_string());
    }
    for (key, value) in secret.string_data.iter().flatten() {
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Decode a base64 value that may be pasted with surrounding whitespace
pub fn decode_base64(value: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(value.trim()).ok()
}

pub(crate) fn required<'a>(secret: &'a SecretData, key: &str) -> Result<&'a str, AdapterError> {
    secret
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AdapterError::Credentials(format!("secret key '{}' is missing", key)))
}

/// TLS settings shared by the HTTPS based adapters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trust {
    /// PEM bundle to trust
    pub cacert: Option<String>,
    /// Skip certificate verification
    pub insecure_skip_verify: bool,
}

impl Trust {
    /// Read `cacert` and `insecureSkipVerify` from a secret
    pub fn from_secret(secret: &SecretData) -> Self {
        Self {
            cacert: secret.get("cacert").filter(|v| !v.is_empty()).cloned(),
            insecure_skip_verify: secret
                .get("insecureSkipVerify")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    /// HTTP client honoring the trust settings
    pub fn client(&self) -> Result<reqwest::Client, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.insecure_skip_verify)
            .timeout(std::time::Duration::from_secs(60));
        if let Some(pem) = &self.cacert {
            for cert in reqwest::Certificate::from_pem_bundle(pem.as_bytes())? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder.build()?)
    }
}

/// Operations against one source provider
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Log in and run a cheap call
    async fn test_connection(&self) -> Result<(), AdapterError>;

    /// Current power state of a VM
    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError>;

    /// Request a power off (returns once the request is accepted)
    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError>;

    /// Request a power on
    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError>;

    /// Snapshot a VM (or each of the given disks)
    async fn create_snapshot(&self, vm_id: &str, disk_ids: &[String], label: &str) -> Result<Vec<SnapshotRef>, AdapterError>;

    /// `None` while the snapshot is still being taken. Once complete, the reference to keep in
    /// status, which may differ from the one `create_snapshot` returned (vSphere hands out a
    /// task first and the snapshot only when the task succeeds).
    async fn snapshot_ready(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError>;

    /// Remove a snapshot; removing one that is already gone succeeds
    async fn remove_snapshot(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError>;
}

/// Build the adapter of a provider from its decoded secret.
///
/// `cluster` is only used by KubeVirt sources and `inventory` only by Hyper-V, whose power
/// state is read from the inventory.
pub fn new_adapter(
    provider: &Provider,
    secret: &SecretData,
    cluster: Option<Client>,
    inventory: Arc<dyn InventoryClientTrait>,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let spec = &provider.spec;
    Ok(match spec.type_ {
        ProviderType::VSphere => Arc::new(vsphere::VSphereAdapter::new(&spec.url, secret)?),
        ProviderType::OVirt => Arc::new(ovirt::OvirtAdapter::new(&spec.url, secret)?),
        ProviderType::OpenStack => Arc::new(openstack::OpenstackAdapter::new(&spec.url, secret)?),
        ProviderType::Ec2 => Arc::new(ec2::Ec2Adapter::new(&spec.settings, secret)?),
        ProviderType::Ova => Arc::new(ova::OvaAdapter),
        ProviderType::HyperV => Arc::new(hyperv::HyperVAdapter::new(provider.uid().unwrap_or_default(), inventory)),
        ProviderType::OpenShift => {
            let client = cluster.ok_or_else(|| AdapterError::Unsupported("no cluster client for openshift source".to_string()))?;
            Arc::new(openshift::OpenshiftAdapter::new(client))
        }
    })
}

/// Builds adapters for providers
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Adapter for a source provider
    async fn adapter(&self, provider: &Provider) -> Result<Arc<dyn SourceAdapter>, ControllerError>;
}

/// Reads provider secrets from the cluster
pub struct KubeAdapterFactory {
    client: Client,
    inventory: Arc<dyn InventoryClientTrait>,
}

impl KubeAdapterFactory {
    /// Create a factory
    pub fn new(client: Client, inventory: Arc<dyn InventoryClientTrait>) -> Self {
        Self { client, inventory }
    }
}

#[async_trait]
impl AdapterFactory for KubeAdapterFactory {
    async fn adapter(&self, provider: &Provider) -> Result<Arc<dyn SourceAdapter>, ControllerError> {
        let secret = match &provider.spec.secret {
            Some(reference) => {
                let namespace = provider.namespace().unwrap_or_default();
                let secrets: Api<Secret> = Api::namespaced(self.client.clone(), reference.namespace_or(&namespace));
                secret_data(&secrets.get(&reference.name).await?)
            }
            None => SecretData::new(),
        };
        let cluster = match provider.spec.type_ {
            ProviderType::OpenShift if provider.is_host() => Some(self.client.clone()),
            ProviderType::OpenShift => Some(crate::cluster::remote_client(&provider.spec.url, &secret).await?),
            _ => None,
        };
        Ok(new_adapter(provider, &secret, cluster, Arc::clone(&self.inventory))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn test_secret_data_decodes_both_maps() {
        let secret = Secret {
            data: Some(BTreeMap::from([("user".to_string(), ByteString(b"admin\n".to_vec()))])),
            string_data: Some(BTreeMap::from([("password".to_string(), "s3cret".to_string())])),
            ..Default::default()
        };
        let data = secret_data(&secret);
        assert_eq!(data.get("user").map(String::as_str), Some("admin"));
        assert_eq!(required(&data, "password").unwrap(), "s3cret");
        assert!(matches!(required(&data, "url"), Err(AdapterError::Credentials(_))));
    }

    #[test]
    fn test_trust_from_secret() {
        let secret = SecretData::from([("insecureSkipVerify".to_string(), "TRUE".to_string())]);
        let trust = Trust::from_secret(&secret);
        assert!(trust.insecure_skip_verify);
        assert!(trust.cacert.is_none());
        assert!(trust.client().is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            AdapterError::from_status(reqwest::StatusCode::UNAUTHORIZED, "login", ""),
            AdapterError::Authentication(_)
        ));
        let err = AdapterError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "vms", "busy");
        assert!(err.is_transient());
        assert!(!AdapterError::from_status(reqwest::StatusCode::NOT_FOUND, "vm", "").is_transient());
    }
}
