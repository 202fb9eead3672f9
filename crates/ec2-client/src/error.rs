//! EC2 client errors

use thiserror::Error;

/// Errors that can occur when talking to AWS
#[derive(Debug, Error)]
pub enum Ec2Error {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// AWS returned an error document
    #[error("AWS error {code}: {message}")]
    Api { code: String, message: String },

    /// Response could not be understood
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Invalid URL or endpoint override
    #[error("Invalid endpoint: {0}")]
    Endpoint(String),

    /// Missing or invalid credentials
    #[error("Invalid credentials: {0}")]
    Credentials(String),
}

impl Ec2Error {
    /// AWS error code, when the failure came from the API
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the referenced object does not exist
    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(|c| c.ends_with(".NotFound") || c == "ResourceNotFoundException")
    }

    /// Throttling and transport failures worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { code, .. } => matches!(
                code.as_str(),
                "RequestLimitExceeded" | "Throttling" | "ThrottlingException" | "InternalError" | "ServiceUnavailable"
            ),
            _ => false,
        }
    }
}
