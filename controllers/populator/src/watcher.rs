//! Kubernetes resource watchers.
//!
//! Claims are watched with kube_runtime::Controller. Claims that do not reference a populator
//! kind are skipped by the reconciler. Failed claims are requeued with a per-claim Fibonacci
//! backoff.

use crate::error::ControllerError;
use crate::reconciler::{claim_key, Reconciler};
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::Api;
use kube_runtime::{controller::Config as ControllerConfig, watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Watches claims and drives their populators.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    claim_api: Api<PersistentVolumeClaim>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, claim_api: Api<PersistentVolumeClaim>) -> Self {
        Self { reconciler, claim_api }
    }

    /// Starts watching PersistentVolumeClaim resources.
    pub async fn watch_claims(&self) -> Result<(), ControllerError> {
        info!("Starting PersistentVolumeClaim watcher");

        let error_policy = |claim: Arc<PersistentVolumeClaim>, error: &ControllerError, ctx: Arc<Reconciler>| {
            ctx.error_action(&claim_key(&claim), error)
        };

        let reconcile = |claim: Arc<PersistentVolumeClaim>, ctx: Arc<Reconciler>| async move {
            let action = ctx.reconcile_claim(&claim).await?;
            ctx.reconciled(&claim_key(&claim));
            Ok::<_, ControllerError>(action)
        };

        let concurrency = self.reconciler.config().max_concurrent_reconciles;
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(concurrency);

        Controller::new(self.claim_api.clone(), watcher::Config::default())
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {:?}", obj),
                    Err(e) => error!("Controller error for PersistentVolumeClaim: {}", e),
                }
            })
            .await;

        Err(ControllerError::Watch("PersistentVolumeClaim controller stream ended".to_string()))
    }
}
