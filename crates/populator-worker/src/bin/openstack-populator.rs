//! OpenStack volume populator

use clap::Parser;
use crds::PopulatorKind;
use populator_worker::cli::{self, CommonArgs};
use populator_worker::credentials::OpenstackCredentials;
use populator_worker::openstack::OpenstackPopulator;
use populator_worker::progress::REPORT_INTERVAL;
use populator_worker::{DiskSink, KubeStatusWriter, PopulatorError, ProgressReporter};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "openstack-populator", about = "Stream an OpenStack image into a volume")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Keystone URL
    #[arg(long)]
    identity_url: String,

    /// Image holding the source volume
    #[arg(long)]
    image_id: String,
}

async fn run(args: Args) -> Result<(), PopulatorError> {
    let credentials = OpenstackCredentials::from_env()?;
    let writer =
        KubeStatusWriter::connect(PopulatorKind::Openstack, &args.common.cr_name, &args.common.cr_namespace).await?;
    let mut reporter = ProgressReporter::new(Arc::new(writer), REPORT_INTERVAL);
    let mut sink = DiskSink::open(&args.common.volume_path).await?;

    OpenstackPopulator::new(&args.identity_url, credentials)?
        .populate(&args.image_id, &mut sink, &mut reporter)
        .await?;
    sink.finish().await
}

#[tokio::main]
async fn main() {
    cli::init_tracing();
    let args = Args::parse();
    cli::exit_with(run(args).await)
}
