//! Migration CRD
//!
//! One execution attempt of a Plan. The per-VM pipelines live in the status
//! so every reconcile can resume from the declarative store alone.

use crate::condition::Condition;
use crate::references::{ResourceRef, SourceRef};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Migration",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.plan.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Plan to execute
    pub plan: ResourceRef,

    /// Cancel the whole migration
    #[serde(default)]
    pub cancel: bool,

    /// Cancel individual VMs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel_vms: Vec<SourceRef>,

    /// Cutover time for warm migrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,
}

/// Migration lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MigrationPhase {
    /// Waiting for admission
    #[default]
    #[serde(alias = "pending")]
    Pending,
    /// VM pipelines are executing
    #[serde(alias = "running")]
    Running,
    /// Cancellation in progress
    #[serde(alias = "canceling")]
    Canceling,
    /// All VMs succeeded
    #[serde(alias = "succeeded")]
    Succeeded,
    /// At least one VM failed
    #[serde(alias = "failed")]
    Failed,
    /// Canceled
    #[serde(alias = "canceled")]
    Canceled,
}

impl MigrationPhase {
    /// Terminal phases are never written again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// PascalCase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Canceling => "Canceling",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the migration was admitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the migration reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// When cancellation was first observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<DateTime<Utc>>,

    /// The cutover time was defaulted by the controller (warning already emitted)
    #[serde(default)]
    pub cutover_defaulted: bool,

    /// Per-VM status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<VmStatus>,
}

/// Named steps of a VM pipeline, in execution order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepName {
    /// Resolve target names and record the source power state
    Initialize,
    /// Power off the source VM
    PowerOff,
    /// Snapshot source disks
    CreateSnapshot,
    /// Create target claims and populators
    CreateVolumes,
    /// Run the pre-migration hook
    PreHook,
    /// Transfer disk data
    DiskTransfer,
    /// Transfer and convert with virt-v2v
    DiskTransferV2v,
    /// Warm migration final switch
    Cutover,
    /// Convert the guest in place
    GuestConversion,
    /// Create the target VM
    #[serde(rename = "CreateVM")]
    CreateVm,
    /// Run the post-migration hook
    PostHook,
    /// Clean up and complete
    Finalize,
}

impl StepName {
    /// Serialized name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::PowerOff => "PowerOff",
            Self::CreateSnapshot => "CreateSnapshot",
            Self::CreateVolumes => "CreateVolumes",
            Self::PreHook => "PreHook",
            Self::DiskTransfer => "DiskTransfer",
            Self::DiskTransferV2v => "DiskTransferV2v",
            Self::Cutover => "Cutover",
            Self::GuestConversion => "GuestConversion",
            Self::CreateVm => "CreateVM",
            Self::PostHook => "PostHook",
            Self::Finalize => "Finalize",
        }
    }

    /// Steps counted against the per-migration transfer concurrency cap
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::DiskTransfer | Self::DiskTransferV2v)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of a step or task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum StepPhase {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Completed successfully
    Succeeded,
    /// Completed with an error
    Failed,
    /// Not applicable
    Skipped,
}

impl StepPhase {
    /// Succeeded, Failed or Skipped
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Progress counter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Units completed
    pub completed: i64,
    /// Units expected
    pub total: i64,
}

/// A unit of work within a step (one disk for transfers)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task name (disk identifier for transfers)
    pub name: String,

    /// Task phase
    #[serde(default)]
    pub phase: StepPhase,

    /// Progress (MiB for transfers)
    #[serde(default)]
    pub progress: Progress,

    /// Free-form annotations (e.g. unit)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One step of a VM pipeline
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step name
    pub name: StepName,

    /// Human readable description
    #[serde(default)]
    pub description: String,

    /// Step phase
    #[serde(default)]
    pub phase: StepPhase,

    /// Aggregated progress
    #[serde(default)]
    pub progress: Progress,

    /// Tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,

    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Reason for a Failed or Skipped phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final outcome of a VM
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum VmOutcome {
    /// Migrated
    Succeeded,
    /// Failed
    Failed,
    /// Canceled
    Canceled,
}

/// Source power state as observed before migration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    On,
    /// Stopped
    Off,
    /// Could not be determined
    Unknown,
}

/// How disk data reaches the target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferMethod {
    /// Volume populator per disk
    Populator,
    /// virt-v2v copies and converts
    #[default]
    V2v,
    /// CDI DataVolume import (warm checkpoints, KubeVirt clone)
    DataVolume,
}

/// A source-side snapshot (or image) created for a VM
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    /// Snapshot, image or EBS snapshot identifier
    pub id: String,

    /// Source disk the snapshot belongs to (per-disk snapshots only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_id: Option<String>,
}

/// One warm precopy round
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    /// Round start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    /// Round end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    /// Snapshot ending this round
    pub snapshot: String,
}

/// Warm migration state
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WarmStatus {
    /// Precopy rounds, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precopies: Vec<Precopy>,

    /// When the next precopy starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_precopy_at: Option<DateTime<Utc>>,

    /// Consecutive failures
    #[serde(default)]
    pub failures: u32,

    /// Completed rounds
    #[serde(default)]
    pub successes: u32,
}

/// Error recorded against a VM
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmError {
    /// Step that failed
    pub phase: String,

    /// Reasons
    pub reasons: Vec<String>,
}

/// Per-VM migration status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Source VM identifier
    pub id: String,

    /// Source VM name
    #[serde(default)]
    pub name: String,

    /// Target VM name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// Current step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<StepName>,

    /// Transfer method chosen at admission
    pub transfer_method: TransferMethod,

    /// Ordered pipeline
    #[serde(default)]
    pub pipeline: Vec<Step>,

    /// Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VmError>,

    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Final outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<VmOutcome>,

    /// Source power state before migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_power_state: Option<PowerState>,

    /// Source snapshots/images created for this VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<SnapshotRef>,

    /// Warm migration state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmStatus>,
}

impl VmStatus {
    /// True when the VM reached an outcome
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Source reference of this VM
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Find a pipeline step
    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    /// Find a pipeline step (mutable)
    pub fn step_mut(&mut self, name: StepName) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }
}

impl Migration {
    /// Current phase (Pending when no status was written yet)
    pub fn phase(&self) -> MigrationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_serialization() {
        assert_eq!(serde_json::to_string(&StepName::CreateVm).unwrap(), "\"CreateVM\"");
        assert_eq!(
            serde_json::to_string(&StepName::DiskTransferV2v).unwrap(),
            "\"DiskTransferV2v\""
        );
    }

    #[test]
    fn test_phase_accepts_lowercase() {
        let phase: MigrationPhase = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(phase, MigrationPhase::Running);
        assert!(!phase.is_terminal());
        assert!(MigrationPhase::Canceled.is_terminal());
    }

    #[test]
    fn test_step_order_matches_pipeline_order() {
        assert!(StepName::Initialize < StepName::PowerOff);
        assert!(StepName::DiskTransfer < StepName::Cutover);
        assert!(StepName::Cutover < StepName::GuestConversion);
        assert!(StepName::CreateVm < StepName::Finalize);
    }
}
