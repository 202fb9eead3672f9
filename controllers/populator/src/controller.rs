//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the claim watcher to the reconciler.

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for volume populators.
pub struct Controller {
    claim_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Populator Controller");

        let kube_client = Client::try_default().await?;

        let claim_api: Api<PersistentVolumeClaim> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };

        let reconciler = Arc::new(Reconciler::new(kube_client, config));
        let watcher = Watcher::new(reconciler, claim_api);

        let claim_watcher = tokio::spawn(async move { watcher.watch_claims().await });

        Ok(Self { claim_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Populator Controller running");

        self.claim_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("PersistentVolumeClaim watcher panicked: {}", e)))?
    }
}
