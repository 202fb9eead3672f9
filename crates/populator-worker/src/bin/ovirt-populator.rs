//! oVirt volume populator

use clap::Parser;
use crds::PopulatorKind;
use populator_worker::cli::{self, CommonArgs};
use populator_worker::credentials::OvirtCredentials;
use populator_worker::ovirt::OvirtPopulator;
use populator_worker::progress::REPORT_INTERVAL;
use populator_worker::{DiskSink, KubeStatusWriter, PopulatorError, ProgressReporter};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "ovirt-populator", about = "Stream an oVirt disk into a volume")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// oVirt engine URL
    #[arg(long)]
    engine_url: String,

    /// Disk to download
    #[arg(long)]
    disk_id: String,
}

async fn run(args: Args) -> Result<(), PopulatorError> {
    let credentials = OvirtCredentials::from_env()?;
    let writer = KubeStatusWriter::connect(PopulatorKind::Ovirt, &args.common.cr_name, &args.common.cr_namespace).await?;
    let mut reporter = ProgressReporter::new(Arc::new(writer), REPORT_INTERVAL);
    let mut sink = DiskSink::open(&args.common.volume_path).await?;

    OvirtPopulator::new(&args.engine_url, credentials)?
        .populate(&args.disk_id, &mut sink, &mut reporter)
        .await?;
    sink.finish().await
}

#[tokio::main]
async fn main() {
    cli::init_tracing();
    let args = Args::parse();
    cli::exit_with(run(args).await)
}
