//! Plan CRD
//!
//! Declares what to migrate (a VM list), from which source provider to which destination,
//! with which network/storage mappings and in which mode.

use crate::condition::Condition;
use crate::mapping::ProviderPair;
use crate::references::{ResourceRef, SourceRef};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

/// Schema for free-form Kubernetes structures (e.g. affinity) kept as raw JSON
fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Plan",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source and destination providers
    pub provider: ProviderPair,

    /// Explicit mapping references
    #[serde(default)]
    pub map: PlanMaps,

    /// Inline network pairs ("src:target,..." with target default|ignored|name|ns/name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_pairs: Option<String>,

    /// Inline storage pairs ("src:class;key=value,...")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pairs: Option<String>,

    /// Default destination for the first source network when mappings are synthesized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target_network: Option<String>,

    /// Target namespace (defaults to the plan namespace)
    #[serde(default)]
    pub target_namespace: String,

    /// VMs to migrate
    #[serde(default)]
    pub vms: Vec<PlanVm>,

    /// Migration type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<MigrationType>,

    /// Legacy warm flag
    #[serde(default)]
    pub warm: bool,

    /// Network used for disk transfer (NAD "ns/name")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ResourceRef>,

    /// PVC name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name_template: Option<String>,

    /// Volume name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name_template: Option<String>,

    /// Network interface name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name_template: Option<String>,

    /// Use the rendered PVC name as a generateName prefix
    #[serde(default = "default_true")]
    pub pvc_name_template_use_generate_name: bool,

    /// Copy disks without converting the guest
    #[serde(default)]
    pub skip_guest_conversion: bool,

    /// Use emulated (SATA/e1000e) devices instead of virtio
    #[serde(default)]
    pub use_compatibility_mode: bool,

    /// Labels applied to target VMs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_labels: BTreeMap<String, String>,

    /// Node selector applied to target VMs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_node_selector: BTreeMap<String, String>,

    /// Affinity applied to target VMs (core/v1 Affinity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub target_affinity: Option<serde_json::Value>,

    /// Power state of target VMs after migration
    #[serde(default)]
    pub target_power_state: TargetPowerState,

    /// Keep static IP configuration of the guest
    #[serde(default)]
    pub preserve_static_ips: bool,

    /// Keep the oVirt cluster CPU model
    #[serde(default)]
    pub preserve_cluster_cpu_model: bool,

    /// Delete target VM and disks of VMs whose migration failed
    #[serde(default)]
    pub delete_vm_on_fail_migration: bool,

    /// Migrate disks shared between VMs
    #[serde(default = "default_true")]
    pub migrate_shared_disks: bool,

    /// Archived plans are no longer reconciled
    #[serde(default)]
    pub archived: bool,
}

/// Explicit mapping references
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMaps {
    /// NetworkMap reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ResourceRef>,

    /// StorageMap reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ResourceRef>,
}

/// A VM in a plan
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    /// Source VM reference
    #[serde(flatten)]
    pub source: SourceRef,

    /// Name of the VM on the target cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// Hooks to run around this VM's migration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRef>,

    /// Per-VM PVC name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name_template: Option<String>,

    /// Per-VM volume name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name_template: Option<String>,

    /// Per-VM network name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name_template: Option<String>,

    /// Index of the boot disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk_index: Option<u32>,

    /// Windows drive letters per disk index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub win_drive_letters: Vec<String>,
}

/// A hook attached to a VM step
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookRef {
    /// When the hook runs
    pub step: HookStep,

    /// Hook reference
    pub hook: ResourceRef,
}

/// Pipeline step a hook is bound to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum HookStep {
    /// Before disks are transferred
    PreHook,
    /// After the target VM exists
    PostHook,
}

impl HookStep {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreHook => "PreHook",
            Self::PostHook => "PostHook",
        }
    }
}

/// Migration mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Power off, then copy
    #[default]
    Cold,
    /// Precopy while running, then cut over
    Warm,
    /// Live migration between clusters
    Live,
    /// Convert guests on pre-populated disks only
    Conversion,
}

impl MigrationType {
    /// Lowercase name used in metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Live => "live",
            Self::Conversion => "conversion",
        }
    }
}

/// Target VM power state after migration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetPowerState {
    /// Started
    On,
    /// Stopped
    Off,
    /// Same as the source VM before migration
    #[default]
    Auto,
}

impl PlanSpec {
    /// Effective migration type (legacy `warm` flag honored when `type` is unset)
    pub fn migration_type(&self) -> MigrationType {
        match self.type_ {
            Some(t) => t,
            None if self.warm => MigrationType::Warm,
            None => MigrationType::Cold,
        }
    }

    /// True when the legacy warm flag disagrees with an explicit type
    pub fn warm_flag_conflict(&self) -> bool {
        self.warm && matches!(self.type_, Some(t) if t != MigrationType::Warm)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Resolved NetworkMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_map: Option<ResourceRef>,

    /// Resolved StorageMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_map: Option<ResourceRef>,

    /// Migration history
    #[serde(default)]
    pub migration: PlanMigrationStatus,
}

/// History of migrations run for a plan
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMigrationStatus {
    /// Completed migrations, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<MigrationHistory>,
}

/// One completed migration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationHistory {
    /// Migration reference
    pub migration: ResourceRef,

    /// Migration UID
    pub uid: String,

    /// Terminal phase ("Succeeded", "Failed", "Canceled")
    pub result: String,

    /// When the migration started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the migration completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl Plan {
    /// True when the plan carries a Ready condition and no blockers
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            crate::condition::is_condition_true(&s.conditions, crate::condition::types::READY)
                && !crate::condition::has_blocker(&s.conditions)
        })
    }

    /// True when the most recent migration of this plan succeeded
    pub fn has_succeeded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            crate::condition::is_condition_true(&s.conditions, crate::condition::types::SUCCEEDED)
        })
    }
}
