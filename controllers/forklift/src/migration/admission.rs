//! Admission of a Migration: plan readiness, one running migration per plan, warm cutover.

use crate::events::{EventSink, CUTOVER_DEFAULTED, CUTOVER_IN_PAST};
use crate::pipeline::{build, PipelineContext};
use chrono::{DateTime, Duration, Utc};
use crds::{
    types, Condition, HookStep, Migration, MigrationPhase, MigrationStatus, MigrationType, Plan, PlanVm, TransferMethod,
    VmStatus,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use std::cmp::Ordering;

/// Condition types written on Migrations
pub mod conditions {
    pub const PLAN_NOT_READY: &str = "PlanNotReady";
    pub const PLAN_ALREADY_SUCCEEDED: &str = "PlanAlreadySucceeded";
}

/// Delay of the cutover given to warm migrations that did not ask for one
pub fn default_cutover_delay() -> Duration {
    Duration::hours(1)
}

/// What admission decided for a pending migration
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Start executing
    Admit,
    /// Stay pending; the condition says why
    Wait(Condition),
    /// Never run; the migration fails with the condition
    Reject(Condition),
}

fn same_plan(migration: &Migration, plan_namespace: &str, plan_name: &str) -> bool {
    let namespace = migration.namespace().unwrap_or_default();
    migration.spec.plan.name == plan_name && migration.spec.plan.namespace_or(&namespace) == plan_namespace
}

/// Creation order, names break ties
fn created_before(a: &Migration, b: &Migration) -> bool {
    match a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp) {
        Ordering::Equal => a.name_any() < b.name_any(),
        order => order == Ordering::Less,
    }
}

/// Decide whether `migration` may start.
///
/// `siblings` are the migrations of the namespace; the ones executing the same plan block
/// admission while they run, and so do older pending ones so the queue drains in order.
pub fn admit(migration: &Migration, plan: Option<&Plan>, siblings: &[Migration]) -> Admission {
    let Some(plan) = plan.filter(|p| p.is_ready()) else {
        return Admission::Wait(Condition::critical(
            conditions::PLAN_NOT_READY,
            "NotReady",
            format!("Plan '{}' is not ready.", migration.spec.plan.name),
        ));
    };
    if plan.has_succeeded() {
        return Admission::Reject(Condition::critical(
            conditions::PLAN_ALREADY_SUCCEEDED,
            "Succeeded",
            format!("Plan '{}' already succeeded.", plan.name_any()),
        ));
    }

    let plan_namespace = plan.namespace().unwrap_or_default();
    let uid = migration.uid();
    let blocking = siblings.iter().find(|other| {
        other.uid() != uid
            && same_plan(other, &plan_namespace, &plan.name_any())
            && match other.phase() {
                MigrationPhase::Running | MigrationPhase::Canceling => true,
                MigrationPhase::Pending => !other.spec.cancel && created_before(other, migration),
                _ => false,
            }
    });
    match blocking {
        Some(other) => Admission::Wait(Condition::warn(
            types::BLOCKED,
            "Blocked",
            format!("Migration '{}' of the same plan has not finished.", other.name_any()),
        )),
        None => Admission::Admit,
    }
}

/// How admission treats the cutover of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoverDecision {
    /// Nothing to do
    Keep,
    /// No cutover was given; use this one
    Default(DateTime<Utc>),
    /// The requested cutover already passed; cut over as soon as the data is there
    Past,
}

/// Cutover handling at admission; only warm migrations have one
pub fn cutover_decision(mode: MigrationType, cutover: Option<DateTime<Utc>>, now: DateTime<Utc>) -> CutoverDecision {
    if mode != MigrationType::Warm {
        return CutoverDecision::Keep;
    }
    match cutover {
        None => CutoverDecision::Default(now + default_cutover_delay()),
        Some(at) if at <= now => CutoverDecision::Past,
        Some(_) => CutoverDecision::Keep,
    }
}

/// Default cutover still missing from the spec of an admitted warm migration. It counts from
/// the start of the migration, so a retried spec write stores the same time.
pub fn pending_default_cutover(spec_cutover: Option<DateTime<Utc>>, status: &MigrationStatus) -> Option<DateTime<Utc>> {
    if spec_cutover.is_some() || !status.cutover_defaulted || status.phase.is_terminal() {
        return None;
    }
    status.started.map(|started| started + default_cutover_delay())
}

/// Publish the warning matching a cutover decision. `defaulted` is true when the default was
/// already announced for this migration.
pub async fn announce_cutover(events: &dyn EventSink, regarding: &ObjectReference, decision: CutoverDecision, defaulted: bool) {
    match decision {
        CutoverDecision::Default(at) if !defaulted => {
            let note = format!("No cutover time was set; cutover will start at {}.", at.to_rfc3339());
            events.warning(regarding, CUTOVER_DEFAULTED, &note).await;
        }
        CutoverDecision::Past => {
            events
                .warning(regarding, CUTOVER_IN_PAST, "The cutover time has passed; cutover starts after the first transfer.")
                .await;
        }
        _ => {}
    }
}

/// Status record of one plan VM, with its pipeline
pub fn vm_record(plan: &Plan, plan_vm: &PlanVm, pipeline: PipelineContext) -> VmStatus {
    VmStatus {
        id: plan_vm.source.id.clone(),
        name: plan_vm.source.name.clone(),
        target_name: plan_vm.target_name.clone().filter(|n| !n.is_empty()),
        transfer_method: pipeline.transfer,
        pipeline: build(&PipelineContext {
            skip_guest_conversion: plan.spec.skip_guest_conversion,
            pre_hook: plan_vm.hooks.iter().any(|h| h.step == HookStep::PreHook),
            post_hook: plan_vm.hooks.iter().any(|h| h.step == HookStep::PostHook),
            ..pipeline
        }),
        ..VmStatus::default()
    }
}

/// Pipeline inputs of a plan VM before the hook and conversion flags are applied
pub fn pipeline_context(plan: &Plan, provider: crds::ProviderType, transfer: TransferMethod) -> PipelineContext {
    PipelineContext {
        provider,
        mode: plan.spec.migration_type(),
        transfer,
        skip_guest_conversion: plan.spec.skip_guest_conversion,
        pre_hook: false,
        post_hook: false,
    }
}
