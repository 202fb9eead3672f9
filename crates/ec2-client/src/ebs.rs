//! EBS direct API client
//!
//! Reads snapshot contents block by block, which lets a populator stream a snapshot into a
//! volume without creating an intermediate EBS volume.

use crate::endpoint::{set_query, Endpoint};
use crate::error::Ec2Error;
use crate::sigv4::{Credentials, Signer};
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Block size used by the EBS direct API
pub const EBS_BLOCK_SIZE: u64 = 512 * 1024;

const PAGE_SIZE: u32 = 10_000;

/// One allocated block of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotBlock {
    pub block_index: u64,
    pub block_token: String,
}

/// Every allocated block of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotBlocks {
    pub blocks: Vec<SnapshotBlock>,
    pub block_size: u64,
    /// Volume size in GiB
    pub volume_size: u64,
}

impl SnapshotBlocks {
    /// Volume size in bytes
    pub fn volume_bytes(&self) -> u64 {
        self.volume_size * 1024 * 1024 * 1024
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPage {
    #[serde(default)]
    blocks: Vec<SnapshotBlock>,
    #[serde(default)]
    block_size: Option<u64>,
    #[serde(default)]
    volume_size: Option<u64>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, rename = "Message", alias = "message")]
    message: Option<String>,
}

/// EBS direct API client
#[derive(Debug, Clone)]
pub struct EbsClient {
    client: Client,
    endpoint: Endpoint,
    signer: Signer,
}

impl EbsClient {
    pub fn new(region: &str, credentials: Credentials, endpoint: Option<&str>) -> Result<Self, Ec2Error> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            client,
            endpoint: Endpoint::resolve("ebs", region, endpoint)?,
            signer: Signer::new(credentials, region, "ebs"),
        })
    }

    async fn get(&self, url: Url) -> Result<Response, Ec2Error> {
        let mut request = self.client.get(url.clone());
        for (name, value) in self.signer.sign("GET", &url, &[], b"", Utc::now())? {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let code = response
            .headers()
            .get("x-amzn-ErrorType")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_string())
            .unwrap_or_else(|| status.as_u16().to_string());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(body);
        Err(Ec2Error::Api { code, message })
    }

    /// List every allocated block of a snapshot, following pagination
    pub async fn list_snapshot_blocks(&self, snapshot_id: &str) -> Result<SnapshotBlocks, Ec2Error> {
        let mut result = SnapshotBlocks::default();
        let mut next_token: Option<String> = None;

        loop {
            let mut url = self.endpoint.join(&format!("snapshots/{}/blocks", snapshot_id))?;
            let max_results = PAGE_SIZE.to_string();
            let mut query = vec![("maxResults", max_results.as_str())];
            if let Some(token) = &next_token {
                query.push(("pageToken", token.as_str()));
            }
            set_query(&mut url, &query);

            let text = self.get(url).await?.text().await?;
            let page: ListPage = serde_json::from_str(&text)
                .map_err(|e| Ec2Error::Malformed(format!("ListSnapshotBlocks: {}", e)))?;
            next_token = merge_page(&mut result, page);
            debug!("Listed {} blocks of {}", result.blocks.len(), snapshot_id);

            if next_token.is_none() {
                break;
            }
        }
        Ok(result)
    }

    /// Read one block
    pub async fn get_snapshot_block(&self, snapshot_id: &str, block: &SnapshotBlock) -> Result<Bytes, Ec2Error> {
        let mut url = self
            .endpoint
            .join(&format!("snapshots/{}/blocks/{}", snapshot_id, block.block_index))?;
        set_query(&mut url, &[("blockToken", block.block_token.as_str())]);

        let data = self.get(url).await?.bytes().await?;
        if data.len() as u64 > EBS_BLOCK_SIZE {
            return Err(Ec2Error::Malformed(format!(
                "block {} is {} bytes, larger than {}",
                block.block_index,
                data.len(),
                EBS_BLOCK_SIZE
            )));
        }
        Ok(data)
    }
}

fn merge_page(result: &mut SnapshotBlocks, page: ListPage) -> Option<String> {
    result.blocks.extend(page.blocks);
    if let Some(size) = page.block_size {
        result.block_size = size;
    }
    if let Some(size) = page.volume_size {
        result.volume_size = size;
    }
    page.next_token.filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_pages() {
        let mut result = SnapshotBlocks::default();
        let first: ListPage = serde_json::from_str(
            r#"{"Blocks":[{"BlockIndex":0,"BlockToken":"a"},{"BlockIndex":7,"BlockToken":"b"}],
                "BlockSize":524288,"VolumeSize":8,"NextToken":"next"}"#,
        )
        .unwrap();
        assert_eq!(merge_page(&mut result, first), Some("next".to_string()));

        let last: ListPage =
            serde_json::from_str(r#"{"Blocks":[{"BlockIndex":9,"BlockToken":"c"}],"NextToken":""}"#).unwrap();
        assert_eq!(merge_page(&mut result, last), None);

        assert_eq!(result.blocks.len(), 3);
        assert_eq!(result.block_size, EBS_BLOCK_SIZE);
        assert_eq!(result.volume_bytes(), 8 * 1024 * 1024 * 1024);
    }
}
