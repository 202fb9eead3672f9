//! Streaming an HTTP download into the target volume

use crate::error::PopulatorError;
use crate::progress::ProgressReporter;
use crate::sink::DiskSink;
use futures::StreamExt;

/// Copy the response body to the sink; returns the number of bytes written
pub async fn stream_response(
    response: reqwest::Response,
    sink: &mut DiskSink,
    reporter: &mut ProgressReporter,
) -> Result<u64, PopulatorError> {
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        sink.write(&chunk).await?;
        written += chunk.len() as u64;
        reporter.add(chunk.len() as u64).await;
    }
    Ok(written)
}
