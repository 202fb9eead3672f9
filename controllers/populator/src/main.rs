//! Populator Controller
//!
//! Fills claims whose `dataSourceRef` names one of the Forklift populator kinds:
//! - OvirtVolumePopulator: oVirt image transfer
//! - OpenstackVolumePopulator: Glance image download
//! - Ec2VolumePopulator: EBS direct block reads from a snapshot
//! - VSphereXcopyVolumePopulator / OffloadPluginVolumePopulator: storage array copy
//!
//! For each pending claim a scratch "prime" claim and a worker pod are created; when the pod
//! succeeds the prime volume is rebound to the original claim.

#[path = "../../forklift/src/backoff.rs"]
mod backoff;
mod config;
mod controller;
mod error;
mod populator;
mod reconciler;
mod resources;
mod watcher;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Populator Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    for (kind, image) in &config.images {
        info!("  {} image: {}", kind, image);
    }
    info!("  Max concurrent reconciles: {}", config.max_concurrent_reconciles);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
