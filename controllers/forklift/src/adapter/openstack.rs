//! OpenStack adapter
//!
//! Keystone v3 password auth scoped to the project; the token comes back in `X-Subject-Token`
//! and the service catalog gives the public compute, block-storage and image endpoints. A
//! "snapshot" here is each attached volume uploaded to a Glance image, which the populator
//! later downloads.

use super::{required, AdapterError, SecretData, SourceAdapter, Trust};
use async_trait::async_trait;
use crds::{PowerState, SnapshotRef};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

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

/// Keystone v3 base URL
pub fn identity_v3(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with("/v3") {
        url.to_string()
    } else {
        format!("{}/v3", url)
    }
}

/// Public endpoint of the first matching service type, in `region` when given
pub fn select_endpoint(catalog: &[CatalogEntry], service_types: &[&str], region: Option<&str>) -> Option<String> {
    service_types.iter().find_map(|service_type| {
        catalog
            .iter()
            .filter(|e| e.service_type == *service_type)
            .flat_map(|e| e.endpoints.iter())
            .filter(|ep| ep.interface == "public")
            .find(|ep| region.is_none_or(|r| ep.region_id.as_deref().or(ep.region.as_deref()) == Some(r)))
            .map(|ep| ep.url.trim_end_matches('/').to_string())
    })
}

/// Map a Nova server status
pub fn parse_server_status(status: &str) -> PowerState {
    match status {
        "SHUTOFF" | "SUSPENDED" | "SHELVED" | "SHELVED_OFFLOADED" => PowerState::Off,
        "ACTIVE" | "PAUSED" | "REBOOT" | "HARD_REBOOT" | "MIGRATING" | "RESIZE" => PowerState::On,
        _ => PowerState::Unknown,
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    token: String,
    compute: String,
    volume: String,
    image: String,
}

/// Adapter for an OpenStack project
pub struct OpenstackAdapter {
    client: reqwest::Client,
    identity_url: String,
    username: String,
    password: String,
    domain_name: String,
    project_name: String,
    region_name: Option<String>,
    session: Mutex<Option<Endpoints>>,
}

impl OpenstackAdapter {
    /// Create an adapter against the Keystone at `url`
    pub fn new(url: &str, secret: &SecretData) -> Result<Self, AdapterError> {
        Ok(Self {
            client: Trust::from_secret(secret).client()?,
            identity_url: identity_v3(url),
            username: required(secret, "username")?.to_string(),
            password: required(secret, "password")?.to_string(),
            domain_name: secret.get("domainName").filter(|v| !v.is_empty()).cloned().unwrap_or_else(|| "Default".to_string()),
            project_name: required(secret, "projectName")?.to_string(),
            region_name: secret.get("regionName").filter(|v| !v.is_empty()).cloned(),
            session: Mutex::new(None),
        })
    }

    fn auth_body(&self) -> Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.domain_name },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project_name,
                        "domain": { "name": self.domain_name },
                    }
                }
            }
        })
    }

    async fn authenticate(&self) -> Result<Endpoints, AdapterError> {
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
            .json(&self.auth_body())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status, "keystone token", &response.text().await?));
        }
        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Authentication("keystone returned no token".to_string()))?;
        let body: TokenBody = response.json().await?;

        let region = self.region_name.as_deref();
        let find = |types: &[&str]| {
            select_endpoint(&body.token.catalog, types, region)
                .ok_or_else(|| AdapterError::Malformed(format!("no public {} endpoint in the service catalog", types[0])))
        };
        let image = find(&["image"])?;
        Ok(Endpoints {
            token,
            compute: find(&["compute"])?,
            volume: find(&["volumev3", "block-storage", "volume"])?,
            image: if image.ends_with("/v2") { image } else { format!("{}/v2", image) },
        })
    }

    async fn endpoints(&self) -> Result<Endpoints, AdapterError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn send(&self, method: reqwest::Method, url: &str, body: Option<Value>) -> Result<Value, AdapterError> {
        let session = self.endpoints().await?;
        let mut request = self.client.request(method, url).header("X-Auth-Token", &session.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            *self.session.lock().await = None;
        }
        if !status.is_success() {
            return Err(AdapterError::from_status(status, url, &text));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    async fn server_action(&self, vm_id: &str, action: &str) -> Result<(), AdapterError> {
        let url = format!("{}/servers/{}/action", self.endpoints().await?.compute, vm_id);
        match self.send(reqwest::Method::POST, &url, Some(json!({ action: null }))).await {
            // 409 means the server is already in the requested state
            Err(AdapterError::Api { status: 409, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl SourceAdapter for OpenstackAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        *self.session.lock().await = None;
        self.endpoints().await.map(|_| ())
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        let url = format!("{}/servers/{}", self.endpoints().await?.compute, vm_id);
        let server = self.send(reqwest::Method::GET, &url, None).await?;
        Ok(server["server"]["status"].as_str().map(parse_server_status).unwrap_or(PowerState::Unknown))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.server_action(vm_id, "os-stop").await
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.server_action(vm_id, "os-start").await
    }

    async fn create_snapshot(&self, _vm_id: &str, disk_ids: &[String], label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        let volume = self.endpoints().await?.volume;
        let mut images = Vec::with_capacity(disk_ids.len());
        for disk in disk_ids {
            let body = json!({
                "os-volume_upload_image": {
                    "image_name": format!("{}-{}", label, disk),
                    "force": true,
                    "disk_format": "raw",
                    "container_format": "bare",
                }
            });
            let url = format!("{}/volumes/{}/action", volume, disk);
            let response = self.send(reqwest::Method::POST, &url, Some(body)).await?;
            let image = response["os-volume_upload_image"]["image_id"]
                .as_str()
                .ok_or_else(|| AdapterError::Malformed(format!("upload of volume {} returned no image", disk)))?;
            images.push(SnapshotRef { id: image.to_string(), disk_id: Some(disk.clone()) });
        }
        Ok(images)
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        let url = format!("{}/images/{}", self.endpoints().await?.image, snapshot.id);
        let image = self.send(reqwest::Method::GET, &url, None).await?;
        match image["status"].as_str() {
            Some("active") => Ok(Some(snapshot.clone())),
            Some("killed") | Some("deleted") | Some("deactivated") => Err(AdapterError::Api {
                status: 500,
                message: format!("image {} upload failed", snapshot.id),
            }),
            _ => Ok(None),
        }
    }

    async fn remove_snapshot(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        let url = format!("{}/images/{}", self.endpoints().await?.image, snapshot.id);
        match self.send(reqwest::Method::DELETE, &url, None).await {
            Err(AdapterError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
