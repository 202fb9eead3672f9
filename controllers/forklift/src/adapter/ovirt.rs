//! oVirt REST adapter
//!
//! Authenticates through the engine SSO (`/ovirt-engine/sso/oauth/token`, password grant) and
//! drives `/ovirt-engine/api` with JSON. Snapshot creation is asynchronous on the engine; a
//! snapshot is usable once its `snapshot_status` is `ok`.

use super::{required, AdapterError, SecretData, SourceAdapter, Trust};
use async_trait::async_trait;
use crds::{PowerState, SnapshotRef};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Strip the API suffix so paths can be appended
pub fn engine_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix("/ovirt-engine/api").unwrap_or(url);
    url.strip_suffix("/ovirt-engine").unwrap_or(url).to_string()
}

/// Map the engine's VM status
pub fn parse_status(status: &str) -> PowerState {
    match status {
        "down" => PowerState::Off,
        "up" | "powering_up" | "powering_down" | "migrating" | "reboot_in_progress" | "paused" | "saving_state"
        | "restoring_state" | "wait_for_launch" => PowerState::On,
        _ => PowerState::Unknown,
    }
}

/// Adapter for an oVirt engine
pub struct OvirtAdapter {
    client: reqwest::Client,
    engine_url: String,
    user: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl OvirtAdapter {
    /// Create an adapter for the engine at `url`
    pub fn new(url: &str, secret: &SecretData) -> Result<Self, AdapterError> {
        Ok(Self {
            client: Trust::from_secret(secret).client()?,
            engine_url: engine_url(url),
            user: required(secret, "user")?.to_string(),
            password: required(secret, "password")?.to_string(),
            token: Mutex::new(None),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/ovirt-engine/api/{}", self.engine_url, path.trim_start_matches('/'))
    }

    async fn login(&self) -> Result<String, AdapterError> {
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
                ("username", self.user.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let body: TokenResponse = serde_json::from_str(&text).unwrap_or_default();
        match body.access_token {
            Some(token) if status.is_success() => Ok(token),
            _ if status.is_server_error() => Err(AdapterError::from_status(status, "sso token", &text)),
            _ => Err(AdapterError::Authentication(body.error_description.unwrap_or_else(|| status.to_string()))),
        }
    }

    async fn token(&self) -> Result<String, AdapterError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value, AdapterError> {
        for attempt in 0..2 {
            let token = self.token().await?;
            let mut request = self
                .client
                .request(method.clone(), self.api(path))
                .bearer_auth(&token)
                .header("Accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                *self.token.lock().await = None;
                continue;
            }
            let text = response.text().await?;
            if !status.is_success() {
                return Err(AdapterError::from_status(status, path, &text));
            }
            return Ok(serde_json::from_str(&text).unwrap_or(Value::Null));
        }
        Err(AdapterError::Authentication(format!("token rejected for {}", path)))
    }
}

#[async_trait]
impl SourceAdapter for OvirtAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        *self.token.lock().await = None;
        self.send(reqwest::Method::GET, "", None).await.map(|_| ())
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        let vm = self.send(reqwest::Method::GET, &format!("vms/{}", vm_id), None).await?;
        Ok(vm["status"].as_str().map(parse_status).unwrap_or(PowerState::Unknown))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.send(reqwest::Method::POST, &format!("vms/{}/stop", vm_id), Some(&json!({}))).await.map(|_| ())
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.send(reqwest::Method::POST, &format!("vms/{}/start", vm_id), Some(&json!({}))).await.map(|_| ())
    }

    async fn create_snapshot(&self, vm_id: &str, _disk_ids: &[String], label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        let body = json!({ "description": label, "persist_memorystate": false });
        let snapshot = self.send(reqwest::Method::POST, &format!("vms/{}/snapshots", vm_id), Some(&body)).await?;
        let id = snapshot["id"]
            .as_str()
            .ok_or_else(|| AdapterError::Malformed("snapshot response has no id".to_string()))?;
        Ok(vec![SnapshotRef { id: id.to_string(), disk_id: None }])
    }

    async fn snapshot_ready(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        let current = self
            .send(reqwest::Method::GET, &format!("vms/{}/snapshots/{}", vm_id, snapshot.id), None)
            .await?;
        Ok(match current["snapshot_status"].as_str() {
            Some("ok") => Some(snapshot.clone()),
            Some("locked") | None => None,
            Some(other) => {
                return Err(AdapterError::Api { status: 500, message: format!("snapshot {} is {}", snapshot.id, other) })
            }
        })
    }

    async fn remove_snapshot(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        match self
            .send(reqwest::Method::DELETE, &format!("vms/{}/snapshots/{}", vm_id, snapshot.id), None)
            .await
        {
            Err(AdapterError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_url() {
        assert_eq!(engine_url("https://engine/ovirt-engine/api/"), "https://engine");
        assert_eq!(engine_url("https://engine/ovirt-engine"), "https://engine");
        assert_eq!(engine_url("https://engine"), "https://engine");
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("down"), PowerState::Off);
        assert_eq!(parse_status("up"), PowerState::On);
        assert_eq!(parse_status("powering_down"), PowerState::On);
        assert_eq!(parse_status("image_locked"), PowerState::Unknown);
    }

    #[test]
    fn test_requires_credentials() {
        let secret = SecretData::from([("user".to_string(), "admin@internal".to_string())]);
        assert!(matches!(OvirtAdapter::new("https://engine", &secret), Err(AdapterError::Credentials(_))));
    }
}
