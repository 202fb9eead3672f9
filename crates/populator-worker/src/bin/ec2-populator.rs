//! EC2 volume populator

use clap::Parser;
use crds::PopulatorKind;
use ec2_client::EbsClient;
use populator_worker::cli::{self, CommonArgs};
use populator_worker::credentials::ec2_credentials_from_env;
use populator_worker::progress::REPORT_INTERVAL;
use populator_worker::{ec2, DiskSink, KubeStatusWriter, PopulatorError, ProgressReporter};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "ec2-populator", about = "Stream an EBS snapshot into a volume")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// AWS region of the snapshot
    #[arg(long)]
    region: String,

    /// Snapshot to read
    #[arg(long)]
    snapshot_id: String,

    /// EBS endpoint override
    #[arg(long)]
    endpoint: Option<String>,
}

async fn run(args: Args) -> Result<(), PopulatorError> {
    let credentials = ec2_credentials_from_env()?;
    let client = EbsClient::new(&args.region, credentials, args.endpoint.as_deref())?;
    let writer = KubeStatusWriter::connect(PopulatorKind::Ec2, &args.common.cr_name, &args.common.cr_namespace).await?;
    let mut reporter = ProgressReporter::new(Arc::new(writer), REPORT_INTERVAL);
    let mut sink = DiskSink::open(&args.common.volume_path).await?;

    ec2::populate(&client, &args.snapshot_id, &mut sink, &mut reporter).await?;
    sink.finish().await
}

#[tokio::main]
async fn main() {
    cli::init_tracing();
    let args = Args::parse();
    cli::exit_with(run(args).await)
}
