//! OVA Appliance Proxy
//!
//! Front door for the per-provider OVA inventory servers.

use ova_proxy::server::{self, AppState};
use ova_proxy::{KubeProviderLookup, ProxyConfig, ProxyError, ReqwestTransport};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and the TLS listener must agree on one crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting OVA proxy");

    let config = ProxyConfig::from_env()?;
    info!("Configuration:");
    info!("  TLS: {}", if config.tls.is_some() { "enabled" } else { "disabled" });
    info!("  Cache TTL: {:?}", config.cache_ttl);
    info!("  Cluster domain: {}", config.cluster_domain);

    let client = kube::Client::try_default()
        .await
        .map_err(|e| ProxyError::Configuration(format!("Kubernetes client: {}", e)))?;

    let state = AppState::new(
        config,
        Arc::new(KubeProviderLookup::new(client)),
        Arc::new(ReqwestTransport::new()?),
    );
    server::serve(Arc::new(state)).await
}
