//! Inventory API client
//!
//! Implements the inventory REST client. Every provider family has its own tree:
//! `/providers/{type}/{uid}/vms`, `/providers/{type}/{uid}/networks`, ...

use crate::error::InventoryError;
use crate::inventory_trait::InventoryClientTrait;
use crate::models::*;
use crds::ProviderType;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Inventory API client
#[derive(Debug, Clone)]
pub struct InventoryClient {
    client: Client,
    base_url: String,
    token: String,
}

impl InventoryClient {
    /// Create a new inventory client
    ///
    /// # Arguments
    /// * `base_url` - Inventory base URL (e.g., "https://forklift-inventory:8443")
    /// * `token` - Bearer token (the controller's service account token)
    /// * `insecure` - Skip TLS certificate verification
    pub fn new(base_url: String, token: String, insecure: bool) -> Result<Self, InventoryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn provider_url(&self, provider_type: ProviderType, uid: &str) -> String {
        format!("{}/providers/{}/{}", self.base_url, provider_type.as_str(), uid)
    }

    /// GET a JSON document, mapping inventory status codes to errors
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, InventoryError> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(InventoryError::Authentication(format!("{} - {}", status, body)));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(InventoryError::NotFound(url.to_string()));
        }
        // The inventory answers 206 while the provider is still being collected
        if status == StatusCode::PARTIAL_CONTENT {
            return Err(InventoryError::NotReady(url.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InventoryError::Api(format!("{} - {}", status, body)));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            InventoryError::Api(format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Decode a VM document according to the provider family
    fn decode_vm(provider_type: ProviderType, value: serde_json::Value) -> Result<SourceVm, InventoryError> {
        Ok(match provider_type {
            ProviderType::VSphere => SourceVm::VSphere(serde_json::from_value(value)?),
            ProviderType::OVirt => SourceVm::OVirt(serde_json::from_value(value)?),
            ProviderType::OpenStack => SourceVm::OpenStack(serde_json::from_value(value)?),
            ProviderType::Ec2 => SourceVm::Ec2(serde_json::from_value(value)?),
            ProviderType::Ova => SourceVm::Ova(serde_json::from_value(value)?),
            ProviderType::HyperV => SourceVm::HyperV(serde_json::from_value(value)?),
            ProviderType::OpenShift => SourceVm::OpenShift(serde_json::from_value(value)?),
        })
    }

    fn networks_path(provider_type: ProviderType) -> &'static str {
        match provider_type {
            ProviderType::OpenShift => "networkattachmentdefinitions",
            _ => "networks",
        }
    }

    fn storages_path(provider_type: ProviderType) -> &'static str {
        match provider_type {
            ProviderType::VSphere => "datastores",
            ProviderType::OVirt => "storagedomains",
            ProviderType::OpenStack => "volumetypes",
            ProviderType::OpenShift => "storageclasses",
            ProviderType::Ec2 | ProviderType::Ova | ProviderType::HyperV => "storages",
        }
    }
}

#[async_trait::async_trait]
impl InventoryClientTrait for InventoryClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_provider(&self, provider_type: ProviderType, uid: &str) -> Result<ProviderInfo, InventoryError> {
        self.get_json(&self.provider_url(provider_type, uid)).await
    }

    async fn get_vm(&self, provider_type: ProviderType, uid: &str, id: &str) -> Result<SourceVm, InventoryError> {
        let url = format!(
            "{}/vms/{}?detail=4",
            self.provider_url(provider_type, uid),
            urlencoding::encode(id)
        );
        let value: serde_json::Value = self.get_json(&url).await?;
        Self::decode_vm(provider_type, value)
    }

    async fn find_vm(&self, provider_type: ProviderType, uid: &str, name: &str) -> Result<Option<SourceVm>, InventoryError> {
        let url = format!(
            "{}/vms?detail=4&name={}",
            self.provider_url(provider_type, uid),
            urlencoding::encode(name)
        );
        let values: Vec<serde_json::Value> = self.get_json(&url).await?;
        values
            .into_iter()
            .next()
            .map(|value| Self::decode_vm(provider_type, value))
            .transpose()
    }

    async fn list_networks(&self, provider_type: ProviderType, uid: &str) -> Result<Vec<Network>, InventoryError> {
        let url = format!(
            "{}/{}?detail=1",
            self.provider_url(provider_type, uid),
            Self::networks_path(provider_type)
        );
        self.get_json(&url).await
    }

    async fn list_storages(&self, provider_type: ProviderType, uid: &str) -> Result<Vec<Storage>, InventoryError> {
        let url = format!(
            "{}/{}?detail=1",
            self.provider_url(provider_type, uid),
            Self::storages_path(provider_type)
        );
        if provider_type == ProviderType::OpenShift {
            // Storage classes are keyed by name
            let classes: Vec<StorageClass> = self.get_json(&url).await?;
            return Ok(classes
                .into_iter()
                .map(|c| Storage {
                    id: c.name.clone(),
                    name: c.name,
                })
                .collect());
        }
        self.get_json(&url).await
    }

    async fn get_nic_profile(&self, uid: &str, id: &str) -> Result<NicProfile, InventoryError> {
        let url = format!("{}/nicprofiles/{}", self.provider_url(ProviderType::OVirt, uid), id);
        self.get_json(&url).await
    }

    async fn get_ovirt_disk(&self, uid: &str, id: &str) -> Result<OvirtDisk, InventoryError> {
        let url = format!("{}/disks/{}", self.provider_url(ProviderType::OVirt, uid), id);
        self.get_json(&url).await
    }

    async fn get_openstack_volume(&self, uid: &str, id: &str) -> Result<OpenstackVolume, InventoryError> {
        let url = format!("{}/volumes/{}", self.provider_url(ProviderType::OpenStack, uid), id);
        self.get_json(&url).await
    }

    async fn get_ec2_volume(&self, uid: &str, id: &str) -> Result<Ec2Volume, InventoryError> {
        let url = format!("{}/volumes/{}", self.provider_url(ProviderType::Ec2, uid), id);
        self.get_json(&url).await
    }

    async fn list_storage_classes(&self, uid: &str) -> Result<Vec<StorageClass>, InventoryError> {
        let url = format!("{}/storageclasses?detail=1", self.provider_url(ProviderType::OpenShift, uid));
        self.get_json(&url).await
    }

    async fn list_network_attachment_definitions(
        &self,
        uid: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<NetworkAttachmentDefinition>, InventoryError> {
        let mut url = format!(
            "{}/networkattachmentdefinitions?detail=1",
            self.provider_url(ProviderType::OpenShift, uid)
        );
        if let Some(ns) = namespace {
            url.push_str(&format!("&ns={}", urlencoding::encode(ns)));
        }
        self.get_json(&url).await
    }
}
