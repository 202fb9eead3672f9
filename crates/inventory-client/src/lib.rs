//! Forklift Inventory REST API Client
//!
//! Client for the provider inventory service that collects VMs, networks, storage and
//! destination cluster objects for every Provider.
//!
//! # Example
//!
//! ```no_run
//! use crds::ProviderType;
//! use inventory_client::{InventoryClient, InventoryClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = InventoryClient::new(
//!     "https://forklift-inventory:8443".to_string(),
//!     "service-account-token".to_string(),
//!     false,
//! )?;
//!
//! let vm = client.get_vm(ProviderType::VSphere, "provider-uid", "vm-42").await?;
//! let networks = client.list_networks(ProviderType::VSphere, "provider-uid").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod inventory_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::InventoryClient;
pub use error::InventoryError;
pub use models::*;
pub use inventory_trait::InventoryClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockInventoryClient;
