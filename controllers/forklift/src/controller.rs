//! Main controller implementation.
//!
//! This module contains the `Controller` struct that builds the shared reconciler, starts the
//! metrics server and one watcher task per Forklift kind.

use crate::config::Config;
use crate::error::ControllerError;
use crate::metrics::{run_metrics_server, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use inventory_client::InventoryClient;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for Forklift resources.
pub struct Controller {
    metrics: Arc<Metrics>,
    metrics_server: WatcherHandle,
    watchers: Vec<(&'static str, WatcherHandle)>,
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Service account token the inventory accepts; empty when the file cannot be read
fn inventory_token(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(token) => token.trim().to_string(),
        Err(e) => {
            warn!("Cannot read inventory token from {}: {}", path, e);
            String::new()
        }
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Forklift Controller");

        let kube_client = Client::try_default().await?;
        let inventory = InventoryClient::new(
            config.inventory_url.clone(),
            inventory_token(&config.inventory_token_path),
            config.inventory_insecure,
        )?;
        let metrics = Arc::new(Metrics::new()?);

        let namespace = config.watch_namespace.clone();
        let ns = namespace.as_deref();
        let server_api = Api::namespaced(kube_client.clone(), &config.pod_namespace);
        let metrics_port = config.metrics_port;
        let reconciler = Arc::new(Reconciler::new(
            kube_client.clone(),
            config,
            Arc::new(inventory),
            Arc::clone(&metrics),
        ));

        let watcher = Arc::new(Watcher::new(
            reconciler,
            scoped_api(&kube_client, ns),
            server_api,
            scoped_api(&kube_client, ns),
            scoped_api(&kube_client, ns),
            scoped_api(&kube_client, ns),
            scoped_api(&kube_client, ns),
            scoped_api(&kube_client, ns),
        ));

        let metrics_server = tokio::spawn(run_metrics_server(Arc::clone(&metrics), metrics_port));

        let mut watchers = Vec::new();
        macro_rules! spawn_watcher {
            ($name:literal, $method:ident) => {{
                let watcher = Arc::clone(&watcher);
                watchers.push(($name, tokio::spawn(async move { watcher.$method().await })));
            }};
        }
        spawn_watcher!("Provider", watch_providers);
        spawn_watcher!("OVAProviderServer", watch_provider_servers);
        spawn_watcher!("NetworkMap", watch_network_maps);
        spawn_watcher!("StorageMap", watch_storage_maps);
        spawn_watcher!("Hook", watch_hooks);
        spawn_watcher!("Plan", watch_plans);
        spawn_watcher!("Migration", watch_migrations);

        Ok(Self { metrics, metrics_server, watchers })
    }

    /// Runs the controller until a watcher or the metrics server exits.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Forklift Controller running");
        self.metrics.set_ready(true);

        let (names, handles): (Vec<&'static str>, Vec<WatcherHandle>) = self.watchers.into_iter().unzip();
        tokio::select! {
            (result, index, _) = futures::future::select_all(handles) => {
                let name = names.get(index).copied().unwrap_or("unknown");
                result.map_err(|e| ControllerError::Watch(format!("{} watcher panicked: {}", name, e)))?
                    .map_err(|e| ControllerError::Watch(format!("{} watcher error: {}", name, e)))?;
            }
            result = self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("metrics server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
