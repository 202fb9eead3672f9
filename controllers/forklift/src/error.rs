//! Controller-specific error types.
//!
//! Errors that are not covered by upstream library errors: validation failures that must
//! quote the offending input, timeouts of external calls, and source adapter failures.

use crate::adapter::AdapterError;
use inventory_client::InventoryError;
use kube::Error as KubeError;
use kube_runtime::finalizer::Error as FinalizerError;
use thiserror::Error;

/// Errors that can occur in the Forklift Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Inventory API error
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Source hypervisor error
    #[error("Source adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Status or object (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hook input rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed user input; the message quotes the offending token
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external call exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Name template could not be parsed or rendered
    #[error("Template error: {0}")]
    Template(String),

    /// Finalizer add/remove or cleanup failed
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<FinalizerError<ControllerError>>),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Errors worth retrying quietly before surfacing them to the user
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(KubeError::Api(response)) => response.code == 409 || response.code == 429 || response.code >= 500,
            Self::Kube(_) => true,
            Self::Inventory(e) => e.is_transient(),
            Self::Adapter(e) => e.is_transient(),
            Self::Timeout(_) => true,
            Self::Finalizer(e) => match e.as_ref() {
                FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner.is_transient(),
                FinalizerError::AddFinalizer(_) | FinalizerError::RemoveFinalizer(_) => true,
                _ => false,
            },
            _ => false,
        }
    }
}

/// Run an external call with a deadline, mapping expiry to [`ControllerError::Timeout`]
pub async fn with_timeout<T, E, F>(budget: std::time::Duration, what: &str, call: F) -> Result<T, ControllerError>
where
    F: std::future::Future<Output = Result<T, E>>,
    ControllerError: From<E>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result.map_err(ControllerError::from),
        Err(_) => Err(ControllerError::Timeout(format!("{} did not complete within {:?}", what, budget))),
    }
}
