//! Integration tests for the inventory client
//!
//! These tests require a running inventory service.
//! Set INVENTORY_URL, INVENTORY_TOKEN and PROVIDER_UID environment variables to run.

use crds::ProviderType;
use inventory_client::{InventoryClient, InventoryClientTrait};

fn client() -> InventoryClient {
    let url = std::env::var("INVENTORY_URL")
        .unwrap_or_else(|_| "https://localhost:8443".to_string());
    let token = std::env::var("INVENTORY_TOKEN")
        .expect("INVENTORY_TOKEN environment variable must be set");

    InventoryClient::new(url, token, true).expect("Failed to create client")
}

fn provider_uid() -> String {
    std::env::var("PROVIDER_UID").expect("PROVIDER_UID environment variable must be set")
}

#[tokio::test]
#[ignore] // Requires running inventory service
async fn test_provider_is_collected() {
    let provider = client()
        .get_provider(ProviderType::VSphere, &provider_uid())
        .await
        .expect("Failed to get provider");

    println!("Provider {}/{} collected", provider.namespace, provider.name);
}

#[tokio::test]
#[ignore]
async fn test_list_networks_and_datastores() {
    let client = client();
    let uid = provider_uid();

    let networks = client.list_networks(ProviderType::VSphere, &uid).await
        .expect("Failed to list networks");
    let storages = client.list_storages(ProviderType::VSphere, &uid).await
        .expect("Failed to list datastores");

    println!("Found {} networks and {} datastores", networks.len(), storages.len());
}
