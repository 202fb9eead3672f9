//! Forklift Controller
//!
//! Migrates virtual machines from vSphere, oVirt, OpenStack, OVA, EC2, Hyper-V and other
//! KubeVirt clusters into KubeVirt. One process reconciles every Forklift CRD:
//! - Provider / OVAProviderServer: credential checks and OVA inventory servers
//! - NetworkMap / StorageMap: mapping validation against the destination
//! - Hook: hook definition checks
//! - Plan: validation and mapping resolution
//! - Migration: per-VM pipelines, warm precopy, cutover and cancellation

mod adapter;
mod backoff;
mod builder;
mod cluster;
mod config;
mod controller;
mod error;
mod events;
mod hook;
mod inline;
mod mapping;
mod metrics;
mod migration;
mod pipeline;
mod plan;
mod provider;
mod provider_server;
mod reconcile_helpers;
mod reconciler;
mod template;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Forklift Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Controller namespace: {}", config.pod_namespace);
    info!("  Inventory URL: {}", config.inventory_url);
    info!("  Max VMs in flight: {}", config.max_vm_inflight);
    info!("  Precopy interval: {:?}", config.precopy_interval);
    info!("  Metrics port: {}", config.metrics_port);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
