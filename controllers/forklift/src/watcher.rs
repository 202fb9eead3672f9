//! Kubernetes resource watchers.
//!
//! Every Forklift kind is watched with its own kube_runtime::Controller through the generic
//! `watch_resource()` helper. Failed reconciles are requeued with the reconciler's per-object
//! Fibonacci backoff.

use crate::error::ControllerError;
use crate::reconcile_helpers::object_key;
use crate::reconciler::Reconciler;
use crds::{Hook, Migration, NetworkMap, OVAProviderServer, Plan, Provider, StorageMap};
use futures::StreamExt;
use kube::Api;
use kube_runtime::{controller::{Action, Config as ControllerConfig}, watcher, Controller};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Run a kube_runtime::Controller for one kind until its stream ends.
///
/// `reconcile_fn` receives the shared reconciler and the object. Failures are published as
/// warning events once they are worth surfacing, then requeued through
/// [`Reconciler::error_action`].
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        ctx.error_action(&object_key(obj.as_ref()), error)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            match reconcile_fn(Arc::clone(&ctx), Arc::clone(&obj)).await {
                Ok(action) => Ok(action),
                Err(e) => {
                    ctx.surface_failure(obj.as_ref(), &e).await;
                    Err(e)
                }
            }
        }
    };

    // Debounce batches the status writes a reconcile triggers on its own object
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(reconciler.config().max_concurrent_reconciles);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj.name),
                Err(e) => error!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;

    Err(ControllerError::Watch(format!("{} controller stream ended", resource_name)))
}

/// Watches Forklift resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    provider_api: Api<Provider>,
    server_api: Api<OVAProviderServer>,
    network_map_api: Api<NetworkMap>,
    storage_map_api: Api<StorageMap>,
    hook_api: Api<Hook>,
    plan_api: Api<Plan>,
    migration_api: Api<Migration>,
}

impl Watcher {
    /// Creates a new watcher instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reconciler: Arc<Reconciler>,
        provider_api: Api<Provider>,
        server_api: Api<OVAProviderServer>,
        network_map_api: Api<NetworkMap>,
        storage_map_api: Api<StorageMap>,
        hook_api: Api<Hook>,
        plan_api: Api<Plan>,
        migration_api: Api<Migration>,
    ) -> Self {
        Self {
            reconciler,
            provider_api,
            server_api,
            network_map_api,
            storage_map_api,
            hook_api,
            plan_api,
            migration_api,
        }
    }

    /// Starts watching Provider resources.
    pub async fn watch_providers(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.provider_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_provider(resource).await }),
            "Provider",
        )
        .await
    }

    /// Starts watching OVAProviderServer resources.
    pub async fn watch_provider_servers(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.server_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_provider_server(&resource).await }),
            "OVAProviderServer",
        )
        .await
    }

    /// Starts watching NetworkMap resources.
    pub async fn watch_network_maps(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.network_map_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_network_map(&resource).await }),
            "NetworkMap",
        )
        .await
    }

    /// Starts watching StorageMap resources.
    pub async fn watch_storage_maps(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.storage_map_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_storage_map(&resource).await }),
            "StorageMap",
        )
        .await
    }

    /// Starts watching Hook resources.
    pub async fn watch_hooks(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.hook_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_hook(&resource).await }),
            "Hook",
        )
        .await
    }

    /// Starts watching Plan resources.
    pub async fn watch_plans(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.plan_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_plan(&resource).await }),
            "Plan",
        )
        .await
    }

    /// Starts watching Migration resources.
    pub async fn watch_migrations(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.migration_api.clone(),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_migration(&resource).await }),
            "Migration",
        )
        .await
    }
}
