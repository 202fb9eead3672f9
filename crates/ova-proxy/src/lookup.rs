//! Provider to inventory service resolution

use crate::error::ProxyError;
use crds::Provider;
use kube::{Api, Client};
use tracing::debug;

/// Inventory service of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
}

/// Resolves a provider to its inventory service
#[async_trait::async_trait]
pub trait ProviderLookup: Send + Sync {
    /// Resolve the inventory service of `namespace/provider`
    ///
    /// Fails with `ProviderNotFound` when the Provider does not exist and with
    /// `ServiceNotReady` when its status does not name a service yet.
    async fn service_for(&self, namespace: &str, provider: &str) -> Result<ServiceRef, ProxyError>;
}

/// Reads Provider records from the API server
#[derive(Clone)]
pub struct KubeProviderLookup {
    client: Client,
}

impl std::fmt::Debug for KubeProviderLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeProviderLookup").finish_non_exhaustive()
    }
}

impl KubeProviderLookup {
    /// Lookup through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ProviderLookup for KubeProviderLookup {
    async fn service_for(&self, namespace: &str, provider: &str) -> Result<ServiceRef, ProxyError> {
        let api: Api<Provider> = Api::namespaced(self.client.clone(), namespace);
        let key = format!("{}/{}", namespace, provider);
        debug!("Looking up provider {}", key);

        let provider = api
            .get_opt(provider)
            .await
            .map_err(|e| ProxyError::Lookup(format!("{}: {}", key, e)))?
            .ok_or_else(|| ProxyError::ProviderNotFound(key.clone()))?;

        service_of(&provider, namespace).ok_or(ProxyError::ServiceNotReady(key))
    }
}

/// Service recorded in the provider status
pub fn service_of(provider: &Provider, namespace: &str) -> Option<ServiceRef> {
    let service = provider.status.as_ref()?.service.as_ref()?;
    if service.name.is_empty() {
        return None;
    }
    Some(ServiceRef {
        name: service.name.clone(),
        namespace: service.namespace_or(namespace).to_string(),
    })
}
