//! EBS snapshot population
//!
//! Only allocated blocks are read. They are fetched concurrently and written at their own
//! offsets, so holes in the snapshot stay holes in an image file.

use crate::error::PopulatorError;
use crate::progress::ProgressReporter;
use crate::sink::DiskSink;
use bytes::Bytes;
use ec2_client::{EbsClient, SnapshotBlock, SnapshotBlocks, EBS_BLOCK_SIZE};
use futures::StreamExt;
use tracing::info;

/// Blocks fetched at once
const PARALLEL_BLOCKS: usize = 8;

/// Where snapshot blocks come from
#[async_trait::async_trait]
pub trait BlockSource: Send + Sync {
    async fn list_blocks(&self, snapshot_id: &str) -> Result<SnapshotBlocks, PopulatorError>;
    async fn read_block(&self, snapshot_id: &str, block: &SnapshotBlock) -> Result<Bytes, PopulatorError>;
}

#[async_trait::async_trait]
impl BlockSource for EbsClient {
    async fn list_blocks(&self, snapshot_id: &str) -> Result<SnapshotBlocks, PopulatorError> {
        Ok(self.list_snapshot_blocks(snapshot_id).await?)
    }

    async fn read_block(&self, snapshot_id: &str, block: &SnapshotBlock) -> Result<Bytes, PopulatorError> {
        Ok(self.get_snapshot_block(snapshot_id, block).await?)
    }
}

/// Copy every allocated block of `snapshot_id` into the sink
pub async fn populate(
    source: &dyn BlockSource,
    snapshot_id: &str,
    sink: &mut DiskSink,
    reporter: &mut ProgressReporter,
) -> Result<(), PopulatorError> {
    let listing = source.list_blocks(snapshot_id).await?;
    let block_size = if listing.block_size > 0 { listing.block_size } else { EBS_BLOCK_SIZE };
    let allocated = listing.blocks.len() as u64 * block_size;
    info!(
        "Snapshot {}: {} allocated blocks of {} bytes, volume {} GiB",
        snapshot_id,
        listing.blocks.len(),
        block_size,
        listing.volume_size
    );

    sink.ensure_size(listing.volume_bytes()).await?;
    reporter.set_total(allocated);

    let mut reads = futures::stream::iter(listing.blocks.iter())
        .map(|block| async move {
            source
                .read_block(snapshot_id, block)
                .await
                .map(|data| (block.block_index, data))
        })
        .buffer_unordered(PARALLEL_BLOCKS);

    while let Some(read) = reads.next().await {
        let (index, data) = read?;
        sink.write_at(index * block_size, &data).await?;
        reporter.add(data.len() as u64).await;
    }

    reporter.finish().await;
    Ok(())
}
