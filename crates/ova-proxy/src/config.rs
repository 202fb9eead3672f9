//! Proxy configuration from environment variables

use crate::error::ProxyError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Port served without TLS
pub const HTTP_PORT: u16 = 8080;
/// Port served with TLS
pub const HTTPS_PORT: u16 = 8443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Certificate and key paths when TLS is enabled
    pub tls: Option<(PathBuf, PathBuf)>,
    /// How long a built proxy is reused
    pub cache_ttl: Duration,
    /// Cluster DNS domain used to address inventory services
    pub cluster_domain: String,
    /// Port of the per-provider inventory services
    pub inventory_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tls: None,
            cache_ttl: Duration::from_secs(60),
            cluster_domain: "cluster.local".to_string(),
            inventory_port: 8080,
        }
    }
}

impl ProxyConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ProxyError> {
        let defaults = Self::default();

        let tls_enabled = get("PROXY_TLS_ENABLED")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        let tls = if tls_enabled {
            let cert = get("PROXY_TLS_CERT").filter(|v| !v.is_empty()).ok_or_else(|| {
                ProxyError::Configuration("PROXY_TLS_CERT is required when TLS is enabled".to_string())
            })?;
            let key = get("PROXY_TLS_KEY").filter(|v| !v.is_empty()).ok_or_else(|| {
                ProxyError::Configuration("PROXY_TLS_KEY is required when TLS is enabled".to_string())
            })?;
            Some((PathBuf::from(cert), PathBuf::from(key)))
        } else {
            None
        };

        let cache_ttl = match get("PROXY_CACHE_TTL_SECONDS") {
            Some(v) => Duration::from_secs(v.parse().map_err(|_| {
                ProxyError::Configuration(format!("PROXY_CACHE_TTL_SECONDS: invalid value {:?}", v))
            })?),
            None => defaults.cache_ttl,
        };

        let inventory_port = match get("INVENTORY_PORT") {
            Some(v) => v
                .parse()
                .map_err(|_| ProxyError::Configuration(format!("INVENTORY_PORT: invalid value {:?}", v)))?,
            None => defaults.inventory_port,
        };

        Ok(Self {
            tls,
            cache_ttl,
            cluster_domain: get("CLUSTER_DOMAIN").unwrap_or(defaults.cluster_domain),
            inventory_port,
        })
    }

    /// 8443 with TLS, 8080 without
    pub fn listen_port(&self) -> u16 {
        if self.tls.is_some() { HTTPS_PORT } else { HTTP_PORT }
    }
}
