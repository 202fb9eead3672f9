//! Command line flags shared by every worker

use clap::Args;
use std::path::PathBuf;

/// Flags passed to every populator pod
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Block device or image file to write
    #[arg(long)]
    pub volume_path: PathBuf,

    /// Credential secret (its keys arrive as environment variables)
    #[arg(long, default_value = "")]
    pub secret_name: String,

    /// Populator object to report progress to
    #[arg(long)]
    pub cr_name: String,

    /// Namespace of the populator object
    #[arg(long)]
    pub cr_namespace: String,
}

/// Initialize logging for a worker binary
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log the outcome and exit with the status the populator controller expects
pub fn exit_with(result: Result<(), crate::error::PopulatorError>) -> ! {
    match result {
        Ok(()) => {
            tracing::info!("Volume populated");
            std::process::exit(0)
        }
        Err(e) => {
            tracing::error!("Population failed: {}", e);
            std::process::exit(e.exit_code())
        }
    }
}
