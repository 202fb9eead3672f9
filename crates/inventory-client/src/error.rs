//! Inventory client errors

use thiserror::Error;

/// Errors that can occur when interacting with the inventory service
#[derive(Debug, Error)]
pub enum InventoryError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Inventory returned an error
    #[error("Inventory API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (invalid or expired token)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider has not been collected yet
    #[error("Provider inventory not ready: {0}")]
    NotReady(String),

    /// Operation not available for this provider family
    #[error("Unsupported for provider type {0}")]
    Unsupported(String),
}

impl InventoryError {
    /// Transport failures worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::NotReady(_))
    }
}
