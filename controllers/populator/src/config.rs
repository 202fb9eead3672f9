//! Controller configuration read from the environment at start-up.

use crate::error::ControllerError;
use crds::PopulatorKind;
use std::collections::HashMap;

const DEFAULT_OVIRT_IMAGE: &str = "quay.io/kubev2v/ovirt-populator:latest";
const DEFAULT_OPENSTACK_IMAGE: &str = "quay.io/kubev2v/openstack-populator:latest";
const DEFAULT_EC2_IMAGE: &str = "quay.io/kubev2v/ec2-populator:latest";
const DEFAULT_XCOPY_IMAGE: &str = "quay.io/kubev2v/vsphere-xcopy-volume-populator:latest";

/// Populator Controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch (all namespaces when unset)
    pub namespace: Option<String>,
    /// Worker image per kind; the offload plugin kind carries its own image
    pub images: HashMap<PopulatorKind, String>,
    /// Pod restarts allowed on transient failures, per kind
    pub retry_limits: HashMap<PopulatorKind, u32>,
    /// Concurrent reconciliations
    pub max_concurrent_reconciles: u16,
    /// First requeue delay after a failed reconcile
    pub backoff_min_seconds: u64,
    /// Requeue delay cap
    pub backoff_max_seconds: u64,
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
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let mut images = HashMap::new();
        for (kind, key, default) in [
            (PopulatorKind::Ovirt, "OVIRT_POPULATOR_IMAGE", DEFAULT_OVIRT_IMAGE),
            (PopulatorKind::Openstack, "OPENSTACK_POPULATOR_IMAGE", DEFAULT_OPENSTACK_IMAGE),
            (PopulatorKind::Ec2, "EC2_POPULATOR_IMAGE", DEFAULT_EC2_IMAGE),
            (PopulatorKind::VSphereXcopy, "XCOPY_POPULATOR_IMAGE", DEFAULT_XCOPY_IMAGE),
        ] {
            images.insert(kind, lookup(key).unwrap_or_else(|| default.to_string()));
        }

        let mut retry_limits = HashMap::new();
        for kind in PopulatorKind::ALL {
            let key = format!("POPULATOR_RETRY_LIMIT_{}", kind.short_name().to_uppercase());
            let limit = match lookup(&key) {
                Some(value) => value.parse::<u32>().map_err(|_| {
                    ControllerError::InvalidConfig(format!("{} must be a non-negative integer, got '{}'", key, value))
                })?,
                None => default_retry_limit(kind),
            };
            retry_limits.insert(kind, limit);
        }

        let max_concurrent_reconciles = match lookup("MAX_CONCURRENT_RECONCILES") {
            Some(value) => value
                .parse::<u16>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("MAX_CONCURRENT_RECONCILES must be a positive integer, got '{}'", value))
                })?,
            None => 3,
        };

        let seconds = |key: &str, default: u64| -> Result<u64, ControllerError> {
            match lookup(key) {
                Some(value) => value.parse::<u64>().ok().filter(|n| *n > 0).ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("{} must be a positive integer, got '{}'", key, value))
                }),
                None => Ok(default),
            }
        };
        let backoff_min_seconds = seconds("BACKOFF_MIN_SECONDS", 5)?;
        let backoff_max_seconds = seconds("BACKOFF_MAX_SECONDS", 300)?;
        if backoff_max_seconds < backoff_min_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECONDS ({}) is below BACKOFF_MIN_SECONDS ({})",
                backoff_max_seconds, backoff_min_seconds
            )));
        }

        Ok(Self {
            namespace,
            images,
            retry_limits,
            max_concurrent_reconciles,
            backoff_min_seconds,
            backoff_max_seconds,
        })
    }

    /// Retry limit of a kind
    pub fn retry_limit(&self, kind: PopulatorKind) -> u32 {
        self.retry_limits.get(&kind).copied().unwrap_or_else(|| default_retry_limit(kind))
    }
}

fn default_retry_limit(kind: PopulatorKind) -> u32 {
    match kind {
        PopulatorKind::Ovirt | PopulatorKind::Openstack => 3,
        PopulatorKind::Ec2 => 5,
        PopulatorKind::VSphereXcopy | PopulatorKind::OffloadPlugin => 1,
    }
}
