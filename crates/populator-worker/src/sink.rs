//! Target volume writer
//!
//! Block-mode claims are mounted as a device at `/dev/block`; filesystem-mode claims are
//! mounted at `/mnt` and the disk is written to `/mnt/disk.img`.

use crate::error::PopulatorError;
use std::io::SeekFrom;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::info;

#[derive(Debug)]
pub struct DiskSink {
    file: File,
    path: PathBuf,
    block_device: bool,
    position: u64,
}

impl DiskSink {
    pub async fn open(path: &Path) -> Result<Self, PopulatorError> {
        let block_device = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.file_type().is_block_device(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .write(true)
            .create(!block_device)
            .truncate(false)
            .open(path)
            .await?;
        info!(
            "Writing to {} ({})",
            path.display(),
            if block_device { "block device" } else { "image file" }
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_device,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }

    /// Grow an image file to `size` bytes so unwritten ranges read as zeroes
    pub async fn ensure_size(&mut self, size: u64) -> Result<(), PopulatorError> {
        if !self.block_device && self.file.metadata().await?.len() < size {
            self.file.set_len(size).await?;
        }
        Ok(())
    }

    /// Append at the current position
    pub async fn write(&mut self, data: &[u8]) -> Result<(), PopulatorError> {
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Write at an absolute offset
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), PopulatorError> {
        if offset != self.position {
            self.file.seek(SeekFrom::Start(offset)).await?;
        }
        self.file.write_all(data).await?;
        self.position = offset + data.len() as u64;
        Ok(())
    }

    /// Flush and sync to stable storage
    pub async fn finish(mut self) -> Result<(), PopulatorError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_and_offset_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut sink = DiskSink::open(&path).await.unwrap();
        assert!(!sink.is_block_device());
        sink.ensure_size(16).await.unwrap();
        sink.write(b"abcd").await.unwrap();
        sink.write_at(12, b"wxyz").await.unwrap();
        sink.write_at(4, b"ef").await.unwrap();
        sink.finish().await.unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..6], b"abcdef");
        assert_eq!(&data[6..12], &[0u8; 6]);
        assert_eq!(&data[12..], b"wxyz");
    }
}
