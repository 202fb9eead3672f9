//! oVirt disk download through an image transfer
//!
//! Flow: SSO token, create a download image transfer for the disk, wait for it to reach
//! `transferring`, stream the raw image from the transfer URL, then finalize. A failed
//! download cancels the transfer so the disk is unlocked on the engine.

use crate::credentials::OvirtCredentials;
use crate::error::PopulatorError;
use crate::progress::ProgressReporter;
use crate::sink::DiskSink;
use crate::transfer::stream_response;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const TRANSFER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TRANSFER_POLL_ATTEMPTS: u32 = 150;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ImageTransfer {
    pub id: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub transfer_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl ImageTransfer {
    /// URL to download from, preferring the direct host over the engine proxy
    pub fn download_url(&self) -> Option<&str> {
        self.transfer_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.proxy_url.as_deref().filter(|u| !u.is_empty()))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TransferPhase {
    Ready,
    Waiting,
    Failed,
}

fn classify_phase(phase: &str) -> TransferPhase {
    match phase {
        "transferring" => TransferPhase::Ready,
        "initializing" | "resuming" | "" => TransferPhase::Waiting,
        _ => TransferPhase::Failed,
    }
}

/// Strip the API suffix so paths can be appended
pub fn normalize_engine_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix("/ovirt-engine/api").unwrap_or(url);
    url.strip_suffix("/ovirt-engine").unwrap_or(url).to_string()
}

/// oVirt answers numbers as JSON strings
fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug)]
pub struct OvirtPopulator {
    client: Client,
    engine_url: String,
    credentials: OvirtCredentials,
}

impl OvirtPopulator {
    pub fn new(engine_url: &str, credentials: OvirtCredentials) -> Result<Self, PopulatorError> {
        Ok(Self {
            client: credentials.trust.client()?,
            engine_url: normalize_engine_url(engine_url),
            credentials,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/ovirt-engine/api/{}", self.engine_url, path.trim_start_matches('/'))
    }

    async fn token(&self) -> Result<String, PopulatorError> {
        #[derive(Deserialize, Default)]
        struct TokenResponse {
            access_token: Option<String>,
            error_description: Option<String>,
        }

        let response = self
            .client
            .post(format!("{}/ovirt-engine/sso/oauth/token", self.engine_url))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "password"),
                ("scope", "ovirt-app-api"),
                ("username", self.credentials.user.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body: TokenResponse = serde_json::from_str(&response.text().await?).unwrap_or_default();
        match body.access_token {
            Some(token) if status.is_success() => Ok(token),
            _ if status.is_server_error() => Err(PopulatorError::from_status(status, "sso token")),
            _ => Err(PopulatorError::Authentication(
                body.error_description.unwrap_or_else(|| status.to_string()),
            )),
        }
    }

    async fn get_json(&self, token: &str, path: &str) -> Result<Value, PopulatorError> {
        let response = self
            .client
            .get(self.api(path))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), path));
        }
        Ok(response.json().await?)
    }

    async fn post_json(&self, token: &str, path: &str, body: Value) -> Result<Value, PopulatorError> {
        let response = self
            .client
            .post(self.api(path))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), path));
        }
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    async fn disk_size(&self, token: &str, disk_id: &str) -> Result<u64, PopulatorError> {
        let disk = self.get_json(token, &format!("disks/{}", disk_id)).await?;
        parse_size(&disk["provisioned_size"])
            .ok_or_else(|| PopulatorError::Transfer(format!("disk {} has no provisioned size", disk_id)))
    }

    async fn start_transfer(&self, token: &str, disk_id: &str) -> Result<ImageTransfer, PopulatorError> {
        let body = json!({
            "disk": { "id": disk_id },
            "direction": "download",
            "format": "raw",
        });
        let transfer = self.post_json(token, "imagetransfers", body).await?;
        Ok(serde_json::from_value(transfer)?)
    }

    async fn wait_transferring(&self, token: &str, id: &str) -> Result<ImageTransfer, PopulatorError> {
        for _ in 0..TRANSFER_POLL_ATTEMPTS {
            let transfer: ImageTransfer =
                serde_json::from_value(self.get_json(token, &format!("imagetransfers/{}", id)).await?)?;
            match classify_phase(&transfer.phase) {
                TransferPhase::Ready => return Ok(transfer),
                TransferPhase::Waiting => tokio::time::sleep(TRANSFER_POLL_INTERVAL).await,
                TransferPhase::Failed => {
                    return Err(PopulatorError::Transfer(format!(
                        "image transfer {} entered phase {}",
                        id, transfer.phase
                    )));
                }
            }
        }
        Err(PopulatorError::Transfer(format!("image transfer {} never started", id)))
    }

    /// Download `disk_id` into the sink
    pub async fn populate(
        &self,
        disk_id: &str,
        sink: &mut DiskSink,
        reporter: &mut ProgressReporter,
    ) -> Result<(), PopulatorError> {
        let token = self.token().await?;
        let size = self.disk_size(&token, disk_id).await?;
        reporter.set_total(size);
        info!("Downloading disk {} ({} bytes)", disk_id, size);

        let transfer = self.start_transfer(&token, disk_id).await?;
        let result = self.download(&token, &transfer, sink, reporter).await;

        match result {
            Ok(()) => {
                self.post_json(&token, &format!("imagetransfers/{}/finalize", transfer.id), json!({}))
                    .await?;
                reporter.finish().await;
                Ok(())
            }
            Err(e) => {
                if let Err(cancel) = self
                    .post_json(&token, &format!("imagetransfers/{}/cancel", transfer.id), json!({}))
                    .await
                {
                    warn!("Failed to cancel image transfer {}: {}", transfer.id, cancel);
                }
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        token: &str,
        transfer: &ImageTransfer,
        sink: &mut DiskSink,
        reporter: &mut ProgressReporter,
    ) -> Result<(), PopulatorError> {
        let transfer = self.wait_transferring(token, &transfer.id).await?;
        let url = transfer
            .download_url()
            .ok_or_else(|| PopulatorError::Transfer(format!("image transfer {} has no URL", transfer.id)))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), url));
        }
        let written = stream_response(response, sink, reporter).await?;
        info!("Downloaded {} bytes", written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_engine_url() {
        assert_eq!(normalize_engine_url("https://engine.example.com/ovirt-engine/api/"), "https://engine.example.com");
        assert_eq!(normalize_engine_url("https://engine.example.com/ovirt-engine"), "https://engine.example.com");
        assert_eq!(normalize_engine_url("https://engine.example.com"), "https://engine.example.com");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(&json!("10737418240")), Some(10_737_418_240));
        assert_eq!(parse_size(&json!(512)), Some(512));
        assert_eq!(parse_size(&Value::Null), None);
    }

    #[test]
    fn test_transfer_phases() {
        assert_eq!(classify_phase("transferring"), TransferPhase::Ready);
        assert_eq!(classify_phase("initializing"), TransferPhase::Waiting);
        assert_eq!(classify_phase("finished_failure"), TransferPhase::Failed);
        assert_eq!(classify_phase("cancelled_system"), TransferPhase::Failed);
    }

    #[test]
    fn test_download_url_prefers_host() {
        let transfer: ImageTransfer = serde_json::from_value(json!({
            "id": "t1",
            "phase": "transferring",
            "transfer_url": "https://host1:54322/images/abc",
            "proxy_url": "https://engine:54323/images/abc"
        }))
        .unwrap();
        assert_eq!(transfer.download_url(), Some("https://host1:54322/images/abc"));

        let proxied = ImageTransfer {
            transfer_url: Some(String::new()),
            ..transfer
        };
        assert_eq!(proxied.download_url(), Some("https://engine:54323/images/abc"));
    }
}
