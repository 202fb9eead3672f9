//! vSphere XCOPY volume populator

use clap::Parser;
use crds::PopulatorKind;
use populator_worker::cli::{self, CommonArgs};
use populator_worker::progress::REPORT_INTERVAL;
use populator_worker::xcopy::{XcopyRequest, DEFAULT_PLUGIN_DIR};
use populator_worker::{KubeStatusWriter, PopulatorError, ProgressReporter};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "vsphere-xcopy-populator", about = "Copy a vSphere disk with storage array offload")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    source_vm_id: String,

    /// `[DATASTORE] VM_NAME/DISK.vmdk`
    #[arg(long)]
    source_vmdk: String,

    #[arg(long)]
    target_namespace: String,

    /// Claim being populated
    #[arg(long)]
    owner_name: String,

    /// Selects the plugin
    #[arg(long)]
    storage_vendor_product: String,

    #[arg(long)]
    migration_host: Option<String>,

    #[arg(long, default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,
}

async fn run(args: Args) -> Result<(), PopulatorError> {
    let request = XcopyRequest {
        storage_vendor_product: args.storage_vendor_product,
        source_vm_id: args.source_vm_id,
        source_vmdk: args.source_vmdk,
        target_namespace: args.target_namespace,
        owner_name: args.owner_name,
        secret_name: args.common.secret_name,
        migration_host: args.migration_host,
    };
    let writer =
        KubeStatusWriter::connect(PopulatorKind::VSphereXcopy, &args.common.cr_name, &args.common.cr_namespace)
            .await?;
    let mut reporter = ProgressReporter::new(Arc::new(writer), REPORT_INTERVAL);
    request.run(&args.plugin_dir, &mut reporter).await
}

#[tokio::main]
async fn main() {
    cli::init_tracing();
    let args = Args::parse();
    cli::exit_with(run(args).await)
}
