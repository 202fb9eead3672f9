//! Forklift CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Forklift migration controllers.
//!
//! All kinds live in the `forklift.konveyor.io/v1beta1` API group:
//! - Provider: a source or destination virtualization endpoint
//! - Plan: what to migrate, where, and how
//! - Migration: one execution attempt of a Plan
//! - NetworkMap / StorageMap: source to destination mappings
//! - Hook: a container image (optionally with a playbook) run before or after a VM migrates
//! - OVAProviderServer: the inventory server backing an OVA provider
//! - Volume populators: one kind per source family

pub mod condition;
pub mod hook;
pub mod mapping;
pub mod migration;
pub mod plan;
pub mod populator;
pub mod provider;
pub mod provider_server;
pub mod references;

pub use condition::*;
pub use hook::*;
pub use mapping::*;
pub use migration::*;
pub use plan::*;
pub use populator::*;
pub use provider::*;
pub use provider_server::*;
pub use references::*;

/// API group of every Forklift kind.
pub const GROUP: &str = "forklift.konveyor.io";

/// API version served for every Forklift kind.
pub const VERSION: &str = "v1beta1";

/// Label keys shared by every controller.
pub mod labels {
    /// Owning Migration UID (target-side objects may live in another namespace).
    pub const MIGRATION: &str = "migration";
    /// Owning Plan UID.
    pub const PLAN: &str = "plan";
    /// Source VM identifier.
    pub const VM_ID: &str = "vmID";
    /// Owning Provider UID.
    pub const PROVIDER: &str = "provider";
    /// Owning OVAProviderServer UID.
    pub const SERVER: &str = "server";
    /// Application label.
    pub const APP: &str = "app";
    /// Sub-application label.
    pub const SUBAPP: &str = "subapp";
    /// Hook step (PreHook/PostHook).
    pub const STEP: &str = "step";
    /// Source disk identifier.
    pub const DISK_ID: &str = "diskID";
}
