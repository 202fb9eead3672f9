//! Controller configuration read from the environment at start-up.

use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_POD_NAMESPACE: &str = "konveyor-forklift";
const DEFAULT_INVENTORY_URL: &str = "https://forklift-inventory.konveyor-forklift.svc.cluster.local:8443";
const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_VIRT_V2V_IMAGE: &str = "quay.io/kubev2v/forklift-virt-v2v:latest";
const DEFAULT_OVA_SERVER_IMAGE: &str = "quay.io/kubev2v/forklift-ova-provider-server:latest";

/// Forklift Controller configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Namespace to watch (all namespaces when unset)
    pub watch_namespace: Option<String>,
    /// Namespace the controller runs in; OVA servers live here
    pub pod_namespace: String,
    /// Inventory service base URL
    pub inventory_url: String,
    /// Bearer token file used against the inventory service
    pub inventory_token_path: String,
    /// Skip TLS verification of the inventory service
    pub inventory_insecure: bool,
    /// VMs of one migration allowed in DiskTransfer at the same time
    pub max_vm_inflight: usize,
    /// Concurrent reconciliations per kind
    pub max_concurrent_reconciles: u16,
    /// Interval between warm precopies
    pub precopy_interval: Duration,
    /// How long a canceling migration waits for in-flight objects to disappear
    pub cancel_grace: Duration,
    /// Budget of a single external call
    pub api_call_timeout: Duration,
    /// Requeue interval while waiting on external progress
    pub poll_interval: Duration,
    /// Budget of steps that only create objects
    pub create_phase_timeout: Duration,
    /// Budget of hook steps
    pub hook_phase_timeout: Duration,
    /// Budget of disk transfers
    pub transfer_phase_timeout: Duration,
    /// Budget of guest conversion
    pub conversion_phase_timeout: Duration,
    /// virt-v2v conversion image
    pub virt_v2v_image: String,
    /// OVA catalog server image
    pub ova_server_image: String,
    /// Job retries of hook runs
    pub hook_backoff_limit: i32,
    /// Port of the metrics and probe server
    pub metrics_port: u16,
    /// First error requeue delay
    pub backoff_min_seconds: u64,
    /// Error requeue delay cap
    pub backoff_max_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_namespace: DEFAULT_POD_NAMESPACE.to_string(),
            inventory_url: DEFAULT_INVENTORY_URL.to_string(),
            inventory_token_path: DEFAULT_TOKEN_PATH.to_string(),
            inventory_insecure: false,
            max_vm_inflight: 5,
            max_concurrent_reconciles: 3,
            precopy_interval: Duration::from_secs(60 * 60),
            cancel_grace: Duration::from_secs(120),
            api_call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            create_phase_timeout: Duration::from_secs(10 * 60),
            hook_phase_timeout: Duration::from_secs(30 * 60),
            transfer_phase_timeout: Duration::from_secs(12 * 3600),
            conversion_phase_timeout: Duration::from_secs(4 * 3600),
            virt_v2v_image: DEFAULT_VIRT_V2V_IMAGE.to_string(),
            ova_server_image: DEFAULT_OVA_SERVER_IMAGE.to_string(),
            hook_backoff_limit: 0,
            metrics_port: 2112,
            backoff_min_seconds: 5,
            backoff_max_seconds: 300,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|_| ControllerError::InvalidConfig(format!("{} has an invalid value '{}'", key, value))),
        _ => Ok(default),
    }
}

fn positive<T: PartialOrd + Default>(key: &str, value: T) -> Result<T, ControllerError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ControllerError::InvalidConfig(format!("{} must be greater than zero", key)))
    }
}

impl Config {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).filter(|v| !v.is_empty()).unwrap_or(default);

        let config = Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            pod_namespace: string("POD_NAMESPACE", defaults.pod_namespace),
            inventory_url: string("INVENTORY_URL", defaults.inventory_url),
            inventory_token_path: string("INVENTORY_TOKEN_PATH", defaults.inventory_token_path),
            inventory_insecure: parse(&lookup, "INVENTORY_INSECURE", false)?,
            max_vm_inflight: positive("MAX_VM_INFLIGHT", parse(&lookup, "MAX_VM_INFLIGHT", defaults.max_vm_inflight)?)?,
            max_concurrent_reconciles: positive(
                "MAX_CONCURRENT_RECONCILES",
                parse(&lookup, "MAX_CONCURRENT_RECONCILES", defaults.max_concurrent_reconciles)?,
            )?,
            precopy_interval: Duration::from_secs(60 * positive("PRECOPY_INTERVAL_MINUTES", parse(&lookup, "PRECOPY_INTERVAL_MINUTES", 60u64)?)?),
            cancel_grace: Duration::from_secs(parse(&lookup, "CANCEL_GRACE_SECONDS", 120u64)?),
            api_call_timeout: Duration::from_secs(positive("API_CALL_TIMEOUT_SECONDS", parse(&lookup, "API_CALL_TIMEOUT_SECONDS", 30u64)?)?),
            poll_interval: Duration::from_secs(positive("POLL_INTERVAL_SECONDS", parse(&lookup, "POLL_INTERVAL_SECONDS", 10u64)?)?),
            create_phase_timeout: Duration::from_secs(60 * parse(&lookup, "CREATE_PHASE_TIMEOUT_MINUTES", 10u64)?),
            hook_phase_timeout: Duration::from_secs(60 * parse(&lookup, "HOOK_PHASE_TIMEOUT_MINUTES", 30u64)?),
            transfer_phase_timeout: Duration::from_secs(3600 * parse(&lookup, "TRANSFER_PHASE_TIMEOUT_HOURS", 12u64)?),
            conversion_phase_timeout: Duration::from_secs(3600 * parse(&lookup, "CONVERSION_PHASE_TIMEOUT_HOURS", 4u64)?),
            virt_v2v_image: string("VIRT_V2V_IMAGE", defaults.virt_v2v_image),
            ova_server_image: string("OVA_SERVER_IMAGE", defaults.ova_server_image),
            hook_backoff_limit: parse(&lookup, "HOOK_BACKOFF_LIMIT", defaults.hook_backoff_limit)?,
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            backoff_min_seconds: positive("BACKOFF_MIN_SECONDS", parse(&lookup, "BACKOFF_MIN_SECONDS", defaults.backoff_min_seconds)?)?,
            backoff_max_seconds: parse(&lookup, "BACKOFF_MAX_SECONDS", defaults.backoff_max_seconds)?,
        };

        if config.backoff_max_seconds < config.backoff_min_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECONDS ({}) is below BACKOFF_MIN_SECONDS ({})",
                config.backoff_max_seconds, config.backoff_min_seconds
            )));
        }
        if config.hook_backoff_limit < 0 {
            return Err(ControllerError::InvalidConfig("HOOK_BACKOFF_LIMIT must not be negative".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(entries: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let map: HashMap<String, String> = entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_vm_inflight, 5);
        assert_eq!(config.precopy_interval, Duration::from_secs(3600));
        assert_eq!(config.metrics_port, 2112);
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("WATCH_NAMESPACE", "migrations"),
            ("MAX_VM_INFLIGHT", "2"),
            ("PRECOPY_INTERVAL_MINUTES", "5"),
            ("INVENTORY_INSECURE", "true"),
            ("TRANSFER_PHASE_TIMEOUT_HOURS", "1"),
        ])
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("migrations"));
        assert_eq!(config.max_vm_inflight, 2);
        assert_eq!(config.precopy_interval, Duration::from_secs(300));
        assert!(config.inventory_insecure);
        assert_eq!(config.transfer_phase_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_values_fail_start_up() {
        assert!(matches!(from_map(&[("MAX_VM_INFLIGHT", "many")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(from_map(&[("MAX_VM_INFLIGHT", "0")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(
            from_map(&[("BACKOFF_MIN_SECONDS", "60"), ("BACKOFF_MAX_SECONDS", "10")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
