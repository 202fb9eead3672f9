//! OpenStack image download
//!
//! The source volume has already been uploaded to an image by the migration controller.
//! This authenticates against Keystone v3, finds the image service in the catalog and
//! streams the image file.

use crate::credentials::OpenstackCredentials;
use crate::error::PopulatorError;
use crate::progress::ProgressReporter;
use crate::sink::DiskSink;
use crate::transfer::stream_response;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

impl CatalogEndpoint {
    fn region(&self) -> Option<&str> {
        self.region_id.as_deref().or(self.region.as_deref())
    }
}

/// Keystone v3 base URL
pub fn identity_v3(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with("/v3") {
        url.to_string()
    } else {
        format!("{}/v3", url)
    }
}

/// Public endpoint of `service_type`, in `region` when given
pub fn select_endpoint(catalog: &[CatalogEntry], service_type: &str, region: Option<&str>) -> Option<String> {
    catalog
        .iter()
        .filter(|e| e.service_type == service_type)
        .flat_map(|e| e.endpoints.iter())
        .filter(|ep| ep.interface == "public")
        .find(|ep| region.is_none_or(|r| ep.region() == Some(r)))
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

fn auth_body(credentials: &OpenstackCredentials) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": credentials.username,
                        "domain": { "name": credentials.domain_name },
                        "password": credentials.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": credentials.project_name,
                    "domain": { "name": credentials.domain_name },
                }
            }
        }
    })
}

#[derive(Debug)]
pub struct OpenstackPopulator {
    client: Client,
    identity_url: String,
    credentials: OpenstackCredentials,
}

impl OpenstackPopulator {
    pub fn new(identity_url: &str, credentials: OpenstackCredentials) -> Result<Self, PopulatorError> {
        Ok(Self {
            client: credentials.trust.client()?,
            identity_url: identity_v3(identity_url),
            credentials,
        })
    }

    /// Returns the token and the image service endpoint
    async fn authenticate(&self) -> Result<(String, String), PopulatorError> {
        #[derive(Deserialize)]
        struct TokenBody {
            token: Token,
        }
        #[derive(Deserialize)]
        struct Token {
            #[serde(default)]
            catalog: Vec<CatalogEntry>,
        }

        let response = self
            .client
            .post(format!("{}/auth/tokens", self.identity_url))
            .json(&auth_body(&self.credentials))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), "keystone token"));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PopulatorError::Authentication("keystone returned no token".to_string()))?;
        let body: TokenBody = response.json().await?;

        let endpoint = select_endpoint(&body.token.catalog, "image", self.credentials.region_name.as_deref())
            .ok_or_else(|| PopulatorError::Config("no public image endpoint in the service catalog".to_string()))?;
        Ok((token, endpoint))
    }

    async fn image_size(&self, token: &str, endpoint: &str, image_id: &str) -> Result<u64, PopulatorError> {
        let response = self
            .client
            .get(format!("{}/v2/images/{}", endpoint, image_id))
            .header("X-Auth-Token", token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), image_id));
        }
        let image: Value = response.json().await?;
        if image["status"] != "active" {
            return Err(PopulatorError::Transfer(format!(
                "image {} is {}, not active",
                image_id, image["status"]
            )));
        }
        Ok(image["size"].as_u64().unwrap_or(0))
    }

    /// Download `image_id` into the sink
    pub async fn populate(
        &self,
        image_id: &str,
        sink: &mut DiskSink,
        reporter: &mut ProgressReporter,
    ) -> Result<(), PopulatorError> {
        let (token, endpoint) = self.authenticate().await?;
        let size = self.image_size(&token, &endpoint, image_id).await?;
        reporter.set_total(size);
        info!("Downloading image {} ({} bytes) from {}", image_id, size, endpoint);

        let response = self
            .client
            .get(format!("{}/v2/images/{}/file", endpoint, image_id))
            .header("X-Auth-Token", &token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PopulatorError::from_status(response.status(), image_id));
        }
        let written = stream_response(response, sink, reporter).await?;
        info!("Downloaded {} bytes", written);
        reporter.finish().await;
        Ok(())
    }
}
