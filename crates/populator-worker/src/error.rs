//! Populator worker errors

use thiserror::Error;

/// Exit code for failures that retrying cannot fix
pub const EXIT_PERMANENT: i32 = 2;
/// Exit code for failures worth another attempt
pub const EXIT_TRANSIENT: i32 = 1;

#[derive(Debug, Error)]
pub enum PopulatorError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Source object not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Plugin exited with status {code}: {message}")]
    Plugin { code: i32, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AWS error: {0}")]
    Ec2(#[from] ec2_client::Ec2Error),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PopulatorError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Authentication(_) | Self::NotFound(_) | Self::Config(_) => EXIT_PERMANENT,
            Self::Plugin { code, .. } if *code == EXIT_PERMANENT => EXIT_PERMANENT,
            Self::Ec2(e) if e.is_not_found() => EXIT_PERMANENT,
            Self::Ec2(e) if matches!(e.code(), Some("AuthFailure" | "UnauthorizedOperation" | "AccessDeniedException")) => {
                EXIT_PERMANENT
            }
            _ => EXIT_TRANSIENT,
        }
    }

    /// Classify an HTTP status from a source API
    pub fn from_status(status: reqwest::StatusCode, what: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Authentication(format!("{}: {}", what, status)),
            404 => Self::NotFound(what.to_string()),
            _ => Self::Transfer(format!("{}: {}", what, status)),
        }
    }
}
