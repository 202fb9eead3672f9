//! Per-VM pipeline engine.
//!
//! A pipeline is the ordered list of [`Step`]s stored in a VM's status. Steps advance strictly
//! in order: [`advance`] always returns the first step that is not terminal, so a later step can
//! never complete while an earlier one is still open. Everything here is a pure function of the
//! status so a restarted controller resumes exactly where the previous one stopped.

use crate::config::Config;
use chrono::{DateTime, Utc};
use crds::{MigrationType, Progress, ProviderType, Step, StepName, StepPhase, Task, TransferMethod};
use std::time::Duration;

/// Annotation on transfer tasks naming the progress unit
pub const UNIT_ANNOTATION: &str = "unit";

/// Progress unit of transfer tasks
pub const UNIT_MIB: &str = "MiB";

/// Reason recorded on steps that exceeded their budget
pub const TIMEOUT_REASON: &str = "Timeout";

/// Inputs deciding the shape of a VM pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineContext {
    /// Source provider family
    pub provider: ProviderType,
    /// Migration type of the plan
    pub mode: MigrationType,
    /// How disk data reaches the target
    pub transfer: TransferMethod,
    /// Plan asked to skip guest conversion
    pub skip_guest_conversion: bool,
    /// VM has a PreHook
    pub pre_hook: bool,
    /// VM has a PostHook
    pub post_hook: bool,
}

/// Pick the transfer method of a VM at admission
///
/// `offload` is true when every disk of the VM lands on a storage pair with an offload plugin.
pub fn transfer_method(provider: ProviderType, mode: MigrationType, offload: bool) -> TransferMethod {
    match (mode, provider) {
        (MigrationType::Conversion, _) => TransferMethod::V2v,
        (MigrationType::Warm | MigrationType::Live, _) => TransferMethod::DataVolume,
        (MigrationType::Cold, ProviderType::OpenShift) => TransferMethod::DataVolume,
        (MigrationType::Cold, ProviderType::VSphere) if offload => TransferMethod::Populator,
        (MigrationType::Cold, ProviderType::VSphere | ProviderType::Ova | ProviderType::HyperV) => TransferMethod::V2v,
        (MigrationType::Cold, ProviderType::OVirt | ProviderType::OpenStack | ProviderType::Ec2) => {
            TransferMethod::Populator
        }
    }
}

fn description(name: StepName) -> &'static str {
    match name {
        StepName::Initialize => "Initialize migration.",
        StepName::PowerOff => "Power off the source VM.",
        StepName::CreateSnapshot => "Create source snapshots.",
        StepName::CreateVolumes => "Create target volumes.",
        StepName::PreHook => "Run pre-migration hook.",
        StepName::DiskTransfer => "Transfer disks.",
        StepName::DiskTransferV2v => "Copy disks with virt-v2v.",
        StepName::Cutover => "Final power off and delta transfer.",
        StepName::GuestConversion => "Convert guest operating system.",
        StepName::CreateVm => "Create the target VM.",
        StepName::PostHook => "Run post-migration hook.",
        StepName::Finalize => "Clean up and complete.",
    }
}

/// A fresh, pending step
pub fn new_step(name: StepName) -> Step {
    Step {
        name,
        description: description(name).to_string(),
        phase: StepPhase::Pending,
        progress: Progress::default(),
        tasks: Vec::new(),
        started: None,
        completed: None,
        reason: None,
        error: None,
    }
}

/// Build the ordered steps of one VM
pub fn build(ctx: &PipelineContext) -> Vec<Step> {
    let convert = ctx.provider.needs_guest_conversion() && !ctx.skip_guest_conversion;
    let mut names = vec![StepName::Initialize];
    match ctx.mode {
        MigrationType::Cold => {
            if ctx.provider.supports_power_ops() {
                names.push(StepName::PowerOff);
            }
            if ctx.provider.snapshots_for_cold() {
                names.push(StepName::CreateSnapshot);
            }
            names.push(StepName::CreateVolumes);
            if ctx.pre_hook {
                names.push(StepName::PreHook);
            }
            if ctx.transfer == TransferMethod::V2v {
                names.push(StepName::DiskTransferV2v);
            } else {
                names.push(StepName::DiskTransfer);
                if convert {
                    names.push(StepName::GuestConversion);
                }
            }
        }
        MigrationType::Warm => {
            names.extend([StepName::CreateSnapshot, StepName::CreateVolumes]);
            if ctx.pre_hook {
                names.push(StepName::PreHook);
            }
            names.extend([StepName::DiskTransfer, StepName::Cutover]);
            if convert {
                names.push(StepName::GuestConversion);
            }
        }
        MigrationType::Live => {
            names.push(StepName::CreateVolumes);
            if ctx.pre_hook {
                names.push(StepName::PreHook);
            }
            names.push(StepName::DiskTransfer);
        }
        MigrationType::Conversion => {
            if ctx.pre_hook {
                names.push(StepName::PreHook);
            }
            names.push(StepName::GuestConversion);
        }
    }
    if ctx.mode != MigrationType::Conversion {
        names.push(StepName::CreateVm);
    }
    if ctx.post_hook {
        names.push(StepName::PostHook);
    }
    names.push(StepName::Finalize);
    names.into_iter().map(new_step).collect()
}

/// The next step to work on, or `None` when every step is terminal
pub fn advance(pipeline: &[Step]) -> Option<StepName> {
    pipeline.iter().find(|s| !s.phase.is_terminal()).map(|s| s.name)
}

/// Phase of a step derived from its tasks
///
/// Any failed task fails the step; all tasks succeeded (or skipped) completes it. A step with
/// a running task, or with some tasks already finished, is Running.
pub fn phase_of(tasks: &[Task]) -> StepPhase {
    if tasks.iter().any(|t| t.phase == StepPhase::Failed) {
        return StepPhase::Failed;
    }
    if !tasks.is_empty() && tasks.iter().all(|t| matches!(t.phase, StepPhase::Succeeded | StepPhase::Skipped)) {
        return StepPhase::Succeeded;
    }
    if tasks.iter().any(|t| t.phase != StepPhase::Pending) {
        return StepPhase::Running;
    }
    StepPhase::Pending
}

/// Merge task progress into a step. Progress is monotone and clamped to the task total.
///
/// Returns true when anything changed.
pub fn report(step: &mut Step, task: &str, progress: Progress, now: DateTime<Utc>) -> bool {
    let index = match step.tasks.iter().position(|t| t.name == task) {
        Some(index) => index,
        None => {
            let mut new_task = Task {
                name: task.to_string(),
                ..Task::default()
            };
            if step.name.is_transfer() {
                new_task.annotations.insert(UNIT_ANNOTATION.to_string(), UNIT_MIB.to_string());
            }
            step.tasks.push(new_task);
            step.tasks.len() - 1
        }
    };
    let entry = &mut step.tasks[index];
    let before = entry.progress;

    if progress.total > 0 {
        entry.progress.total = entry.progress.total.max(progress.total);
    }
    let ceiling = if entry.progress.total > 0 { entry.progress.total } else { i64::MAX };
    entry.progress.completed = entry.progress.completed.max(progress.completed.clamp(0, ceiling));

    if entry.progress.completed > 0 && entry.phase == StepPhase::Pending {
        entry.phase = StepPhase::Running;
        entry.started.get_or_insert(now);
    }
    let changed = entry.progress != before;
    aggregate(step);
    changed
}

/// Add a Running task unless one with that name exists.
///
/// Returns true when the task was added, so one-shot side effects (a power-off request, a
/// snapshot) are issued once per task.
pub fn begin_task(step: &mut Step, task: &str, now: DateTime<Utc>) -> bool {
    if step.tasks.iter().any(|t| t.name == task) {
        return false;
    }
    step.tasks.push(Task {
        name: task.to_string(),
        phase: StepPhase::Running,
        started: Some(now),
        ..Task::default()
    });
    true
}

/// True when a task with that name exists
pub fn has_task(step: &Step, task: &str) -> bool {
    step.tasks.iter().any(|t| t.name == task)
}

/// Set the final phase of a task
pub fn finish_task(step: &mut Step, task: &str, phase: StepPhase, error: Option<String>, now: DateTime<Utc>) {
    if let Some(entry) = step.tasks.iter_mut().find(|t| t.name == task) {
        if entry.phase.is_terminal() {
            return;
        }
        if phase == StepPhase::Succeeded && entry.progress.total > 0 {
            entry.progress.completed = entry.progress.total;
        }
        entry.phase = phase;
        entry.error = error;
        entry.started.get_or_insert(now);
        entry.completed = Some(now);
    }
    aggregate(step);
}

fn aggregate(step: &mut Step) {
    step.progress = Progress {
        completed: step.tasks.iter().map(|t| t.progress.completed).sum(),
        total: step.tasks.iter().map(|t| t.progress.total).sum(),
    };
}

/// Mark a step Running
pub fn start(step: &mut Step, now: DateTime<Utc>) {
    if step.phase == StepPhase::Pending {
        step.phase = StepPhase::Running;
        step.started = Some(now);
    }
}

/// Mark a step Succeeded
pub fn succeed(step: &mut Step, now: DateTime<Utc>) {
    terminate(step, StepPhase::Succeeded, None, None, now);
}

/// Mark a step Skipped with a reason
pub fn skip(step: &mut Step, reason: &str, now: DateTime<Utc>) {
    terminate(step, StepPhase::Skipped, Some(reason.to_string()), None, now);
}

/// Mark a step Failed
pub fn fail(step: &mut Step, reason: &str, error: impl Into<String>, now: DateTime<Utc>) {
    terminate(step, StepPhase::Failed, Some(reason.to_string()), Some(error.into()), now);
}

fn terminate(step: &mut Step, phase: StepPhase, reason: Option<String>, error: Option<String>, now: DateTime<Utc>) {
    if step.phase.is_terminal() {
        return;
    }
    step.phase = phase;
    step.reason = reason;
    step.error = error;
    step.started.get_or_insert(now);
    step.completed = Some(now);
}

/// Budgets of step categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    /// Steps that create or delete objects
    pub create: Duration,
    /// Hook runs
    pub hook: Duration,
    /// Disk transfers and the cutover delta
    pub transfer: Duration,
    /// Guest conversion
    pub conversion: Duration,
}

impl From<&Config> for PhaseTimeouts {
    fn from(config: &Config) -> Self {
        Self {
            create: config.create_phase_timeout,
            hook: config.hook_phase_timeout,
            transfer: config.transfer_phase_timeout,
            conversion: config.conversion_phase_timeout,
        }
    }
}

impl PhaseTimeouts {
    /// Budget of a step; zero disables the check
    pub fn budget(&self, name: StepName) -> Duration {
        match name {
            StepName::PreHook | StepName::PostHook => self.hook,
            StepName::DiskTransfer | StepName::DiskTransferV2v | StepName::Cutover => self.transfer,
            StepName::GuestConversion => self.conversion,
            StepName::Initialize
            | StepName::PowerOff
            | StepName::CreateSnapshot
            | StepName::CreateVolumes
            | StepName::CreateVm
            | StepName::Finalize => self.create,
        }
    }
}

/// True when a running step exceeded its budget
///
/// Warm DiskTransfer keeps precopying until cutover and is exempt while `before_cutover`.
pub fn timed_out(step: &Step, mode: MigrationType, before_cutover: bool, timeouts: &PhaseTimeouts, now: DateTime<Utc>) -> bool {
    if step.phase != StepPhase::Running {
        return false;
    }
    if step.name == StepName::DiskTransfer && mode == MigrationType::Warm && before_cutover {
        return false;
    }
    let budget = timeouts.budget(step.name);
    if budget.is_zero() {
        return false;
    }
    let Some(started) = step.started else {
        return false;
    };
    (now - started).to_std().is_ok_and(|elapsed| elapsed > budget)
}

/// Transferred MiB over every transfer step of a pipeline
pub fn transferred_mib(pipeline: &[Step]) -> i64 {
    pipeline
        .iter()
        .filter(|s| s.name.is_transfer())
        .map(|s| s.progress.completed)
        .sum()
}
