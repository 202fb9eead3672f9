//! Proxy errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Provider {0} not found")]
    ProviderNotFound(String),

    #[error("Inventory service for provider {0} is not ready")]
    ServiceNotReady(String),

    #[error("Provider lookup failed: {0}")]
    Lookup(String),

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            Self::ServiceNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Request(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("{}", self);
        }
        (status, self.to_string()).into_response()
    }
}
