//! Reconciliation context shared by every Forklift kind.
//!
//! A single [`Reconciler`] is handed to each `kube_runtime::Controller`. The per-kind logic
//! lives next to its domain:
//! - `plan`: Plan validation and mapping resolution
//! - `migration`: admission, per-VM pipelines, cancellation and cutover
//! - `provider`: credential checks, OVA server ownership and teardown
//! - `provider_server`: OVA inventory server objects
//! - `hook`: Hook validation
//! - `mapping::reconcile`: NetworkMap and StorageMap validation

use crate::adapter::{secret_data, AdapterFactory, KubeAdapterFactory, SecretData};
use crate::backoff::BackoffTable;
use crate::cluster::{remote_client, KubeCluster, TargetCluster};
use crate::config::Config;
use crate::error::{with_timeout, ControllerError};
use crate::events::{EventSink, KubeEvents};
use crate::metrics::Metrics;
use crate::reconcile_helpers::{object_reference, update_status_if_changed, StatusWrite};
use crds::{Provider, ResourceRef};
use inventory_client::InventoryClientTrait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, warn};

/// Reconciles Forklift resources.
pub struct Reconciler {
    pub(crate) client: Client,
    pub(crate) config: Config,
    pub(crate) inventory: Arc<dyn InventoryClientTrait>,
    /// The cluster the controller runs in
    pub(crate) host: Arc<dyn TargetCluster>,
    pub(crate) adapters: Arc<dyn AdapterFactory>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) metrics: Arc<Metrics>,
    /// Error count tracking per object (Kind/namespace/name)
    backoff: BackoffTable,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Client, config: Config, inventory: Arc<dyn InventoryClientTrait>, metrics: Arc<Metrics>) -> Self {
        let backoff = BackoffTable::new(config.backoff_min_seconds, config.backoff_max_seconds);
        Self {
            host: Arc::new(KubeCluster::new(client.clone())),
            adapters: Arc::new(KubeAdapterFactory::new(client.clone(), Arc::clone(&inventory))),
            events: Arc::new(KubeEvents::new(client.clone())),
            client,
            config,
            inventory,
            metrics,
            backoff,
        }
    }

    /// Controller configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Namespaced API of a Forklift kind
    pub(crate) fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Fetch a referenced object, `None` when it does not exist
    pub(crate) async fn lookup<K>(&self, reference: &ResourceRef, default_namespace: &str) -> Result<Option<K>, ControllerError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = self.api(reference.namespace_or(default_namespace));
        self.call(&format!("get {}", reference.name), api.get_opt(&reference.name)).await
    }

    /// Run an external call under the configured per-call budget
    pub(crate) async fn call<T, E, F>(&self, what: &str, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, E>>,
        ControllerError: From<E>,
    {
        with_timeout(self.config.api_call_timeout, what, call).await
    }

    /// Compare-and-set status write of a namespaced object
    pub(crate) async fn write_status<K, S>(&self, obj: &K, current: Option<&S>, desired: &S) -> Result<StatusWrite, ControllerError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        S: Serialize + PartialEq,
    {
        let api: Api<K> = self.api(&obj.namespace().unwrap_or_default());
        update_status_if_changed(&api, obj, current, desired).await
    }

    /// Decoded credential secret of a provider (empty when it has none)
    pub(crate) async fn provider_secret(&self, provider: &Provider) -> Result<Option<SecretData>, ControllerError> {
        let Some(reference) = &provider.spec.secret else {
            return Ok(Some(SecretData::new()));
        };
        let namespace = provider.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), reference.namespace_or(&namespace));
        let secret = self.call("get provider secret", secrets.get_opt(&reference.name)).await?;
        Ok(secret.as_ref().map(secret_data))
    }

    /// Object store of a destination provider: the host cluster or a remote one
    pub(crate) async fn target_cluster(&self, destination: &Provider) -> Result<Arc<dyn TargetCluster>, ControllerError> {
        if destination.is_host() {
            return Ok(Arc::clone(&self.host));
        }
        let secret = self
            .provider_secret(destination)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("secret of provider {}", destination.name_any())))?;
        let client = remote_client(&destination.spec.url, &secret).await?;
        Ok(Arc::new(KubeCluster::new(client)))
    }

    /// Forget the error history of an object after a successful reconcile
    pub(crate) fn reconciled(&self, key: &str) {
        self.backoff.reset(key);
    }

    /// Requeue delay after a failed reconcile.
    ///
    /// Transient failures stay quiet until the same object failed
    /// [`crate::backoff::BACKOFF_SURFACE_THRESHOLD`] times in a row.
    pub fn error_action(&self, key: &str, error: &ControllerError) -> Action {
        let requeue = self.backoff.record_failure(key);
        if !error.is_transient() || requeue.should_surface() {
            error!(
                "Reconciliation failed for {} (attempt {}): {}",
                key, requeue.error_count, error
            );
        } else {
            warn!(
                "Transient failure for {} (attempt {}), retrying in {:?}: {}",
                key, requeue.error_count, requeue.delay, error
            );
        }
        Action::requeue(requeue.delay)
    }

    /// Publish a warning about a failing object once the failure is surfaced. Runs before
    /// [`Self::error_action`] records the failure, hence the `+ 1`.
    pub(crate) async fn surface_failure<K>(&self, obj: &K, error: &ControllerError)
    where
        K: Resource<DynamicType = ()>,
    {
        let key = crate::reconcile_helpers::object_key(obj);
        if !error.is_transient() || self.backoff.error_count(&key) + 1 >= crate::backoff::BACKOFF_SURFACE_THRESHOLD {
            self.events
                .warning(&object_reference(obj), crate::events::RECONCILE_FAILED, &error.to_string())
                .await;
        }
    }
}
