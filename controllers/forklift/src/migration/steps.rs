//! Per-VM pipeline steps.
//!
//! Each step is idempotent: it looks at what the destination already holds (objects are
//! found by the `migration`/`vmID`/`diskID` labels) and at the task records of its step, issues
//! the next side effect, and reports whether it is done. A step that returns
//! [`StepOutcome::Wait`] is entered again on the next pass.

use super::{Run, VmInventory};
use crate::builder::conversion::{build_conversion_pod, pod_outcome, AttachedClaim, ConversionInputs};
use crate::builder::hook::{build_hook_config_map, build_hook_job, hook_object_name, job_outcome, HookRun};
use crate::builder::vm::{build_virtual_machine, guest_shape, TargetNic};
use crate::builder::volume::{
    build_claim, build_data_volume, build_populator, build_transfer_secret, data_source_ref, data_volume_state,
    populator_kind, populator_status, DataVolumeSource, DiskVolume, PopulatorInputs,
};
use crate::builder::{claim_name, dns_label, label_value, uid_prefix, ClaimName, DiskNaming, RunOutcome, VmContext};
use crate::cluster::{from_dynamic, to_dynamic, ScratchKind};
use crate::error::ControllerError;
use crate::mapping::SourceDisk;
use crate::pipeline::{
    advance, begin_task, fail, finish_task, has_task, phase_of, report, skip, start, succeed, timed_out, PhaseTimeouts,
    TIMEOUT_REASON,
};
use crate::plan::nic_destinations;
use crds::{
    labels, settings, HookStep, MigrationType, PlanVm, PopulatorKind, PopulatorPhase, PowerState, Precopy, Progress,
    SnapshotRef, StepName, StepPhase, StorageDestination, TransferMethod, VmError, VmOutcome, VmStatus, VolumeMode,
};
use inventory_client::SourceVm;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

const MIB: u64 = 1 << 20;

/// Task of the power-off request
pub(crate) const POWER_OFF_TASK: &str = "PowerOff";

/// What a step reported for this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Step finished
    Done,
    /// Step does not apply; the reason is recorded on it
    Skip(&'static str),
    /// Step is in progress
    Wait,
    /// Step failed; fails the VM
    Fail(String),
}

/// Capacity of a disk in MiB, rounded up
pub(crate) fn capacity_mib(disk: &SourceDisk) -> i64 {
    i64::try_from(disk.capacity.div_ceil(MIB)).unwrap_or(i64::MAX)
}

/// Whole mebibytes in `bytes`, saturating at `i64::MAX`
pub(crate) fn to_mib(bytes: u64) -> i64 {
    i64::try_from(bytes / MIB).unwrap_or(i64::MAX)
}

/// Selector of the objects of one disk
pub(crate) fn disk_selector(ctx: &VmContext<'_>, disk: &SourceDisk) -> String {
    format!("{},{}={}", ctx.selector(), labels::DISK_ID, label_value(&disk.id))
}

/// Record the end of a VM
pub(crate) fn complete_vm(vm: &mut VmStatus, outcome: VmOutcome, now: chrono::DateTime<chrono::Utc>) {
    vm.outcome = Some(outcome);
    vm.completed = Some(now);
}

pub(crate) fn task_done(vm: &VmStatus, step: StepName, task: &str) -> bool {
    vm.step(step)
        .and_then(|s| s.tasks.iter().find(|t| t.name == task))
        .is_some_and(|t| t.phase.is_terminal())
}

impl Run<'_> {
    /// Advance one VM through as many steps as complete within this pass.
    ///
    /// `slots` is the number of VMs that may still enter a transfer step in this migration.
    pub(crate) async fn drive_vm(&self, plan_vm: &PlanVm, vm: &mut VmStatus, slots: &mut usize) -> Result<(), ControllerError> {
        let timeouts = PhaseTimeouts::from(self.config);
        let mode = self.plan.spec.migration_type();
        vm.started.get_or_insert(self.now);

        while let Some(name) = advance(&vm.pipeline) {
            vm.phase = Some(name);
            let Some(step) = vm.step(name) else {
                break;
            };
            if timed_out(step, mode, !self.cutover_reached(), &timeouts, self.now) {
                let message = format!("{} did not finish within {}s.", name, timeouts.budget(name).as_secs());
                self.fail_vm(vm, name, TIMEOUT_REASON, message).await;
                return Ok(());
            }
            if step.phase == StepPhase::Pending && name.is_transfer() {
                if *slots == 0 {
                    debug!("VM {} waits for a transfer slot", vm.source_ref().key());
                    return Ok(());
                }
                *slots -= 1;
            }
            if let Some(step) = vm.step_mut(name) {
                start(step, self.now);
            }

            let outcome = match self.run_step(name, plan_vm, vm).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_transient() => {
                    warn!("VM {} step {}: {}", vm.source_ref().key(), name, e);
                    return Ok(());
                }
                Err(e) => StepOutcome::Fail(e.to_string()),
            };
            match outcome {
                StepOutcome::Done => {
                    debug!("VM {} completed {}", vm.source_ref().key(), name);
                    if let Some(step) = vm.step_mut(name) {
                        succeed(step, self.now);
                    }
                }
                StepOutcome::Skip(reason) => {
                    if let Some(step) = vm.step_mut(name) {
                        skip(step, reason, self.now);
                    }
                }
                StepOutcome::Wait => return Ok(()),
                StepOutcome::Fail(message) => {
                    self.fail_vm(vm, name, "Failed", message).await;
                    return Ok(());
                }
            }
        }

        info!("VM {} migrated", vm.source_ref().key());
        complete_vm(vm, VmOutcome::Succeeded, self.now);
        Ok(())
    }

    /// Fail a VM at a step. With `deleteVmOnFailMigration` the target objects of the VM are
    /// removed; otherwise they stay for inspection.
    pub(crate) async fn fail_vm(&self, vm: &mut VmStatus, name: StepName, reason: &str, message: String) {
        warn!("VM {} failed at {}: {}", vm.source_ref().key(), name, message);
        if let Some(step) = vm.step_mut(name) {
            fail(step, reason, message.clone(), self.now);
        }
        vm.error = Some(VmError { phase: name.as_str().to_string(), reasons: vec![message] });
        complete_vm(vm, VmOutcome::Failed, self.now);

        if !self.plan.spec.delete_vm_on_fail_migration {
            return;
        }
        let Some(plan_vm) = self.plan_vm(vm) else {
            return;
        };
        let selector = self.ctx(plan_vm, vm).selector();
        let mut kinds = vec![ScratchKind::VirtualMachine, ScratchKind::Pvc, ScratchKind::Pod, ScratchKind::Job];
        if vm.transfer_method == TransferMethod::DataVolume {
            kinds.push(ScratchKind::DataVolume);
        }
        kinds.extend(self.populator_kinds(vm).into_iter().map(ScratchKind::Populator));
        for kind in kinds {
            if let Err(e) = self.delete_selected(kind, &selector).await {
                warn!("Cleanup of {} for failed VM {}: {}", kind.kind(), vm.source_ref().key(), e);
            }
        }
    }

    /// Populator kinds a VM may have objects of
    pub(crate) fn populator_kinds(&self, vm: &VmStatus) -> Vec<PopulatorKind> {
        if vm.transfer_method != TransferMethod::Populator {
            return Vec::new();
        }
        let mut kinds: Vec<PopulatorKind> = self
            .storage_pairs
            .iter()
            .filter_map(|p| populator_kind(self.source.spec.type_, &p.destination))
            .collect();
        kinds.sort_by_key(|k| k.kind());
        kinds.dedup();
        kinds
    }

    async fn run_step(&self, name: StepName, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        match name {
            StepName::Initialize => self.initialize(plan_vm, vm).await,
            StepName::PowerOff => self.power_off(vm).await,
            StepName::CreateSnapshot => self.create_snapshot(plan_vm, vm).await,
            StepName::CreateVolumes => self.create_volumes(plan_vm, vm).await,
            StepName::PreHook => self.run_hook(plan_vm, vm, HookStep::PreHook).await,
            StepName::DiskTransfer if self.plan.spec.migration_type() == MigrationType::Warm => {
                self.precopy(plan_vm, vm).await
            }
            StepName::DiskTransfer => self.transfer(plan_vm, vm).await,
            StepName::DiskTransferV2v => self.convert(plan_vm, vm, false).await,
            StepName::Cutover => self.cutover(plan_vm, vm).await,
            StepName::GuestConversion => self.convert(plan_vm, vm, true).await,
            StepName::CreateVm => self.create_vm(plan_vm, vm).await,
            StepName::PostHook => self.run_hook(plan_vm, vm, HookStep::PostHook).await,
            StepName::Finalize => self.finalize(plan_vm, vm).await,
        }
    }

    /// Inventory of the VM; a VM gone from the inventory fails the step
    pub(crate) async fn require_inventory(&self, plan_vm: &PlanVm, vm: &VmStatus) -> Result<VmInventory, ControllerError> {
        self.vm_inventory(plan_vm, vm)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("VM {} in the inventory", plan_vm.source.key())))
    }

    /// Storage destination of every disk
    pub(crate) fn destinations<'d>(&'d self, disks: &'d [SourceDisk]) -> Result<Vec<DiskVolume<'d>>, ControllerError> {
        disks
            .iter()
            .enumerate()
            .map(|(index, disk)| {
                crate::plan::disk_destination(disk, self.storage_pairs)
                    .map(|destination| DiskVolume { index, disk, destination })
                    .ok_or_else(|| ControllerError::Validation(format!("storage '{}' has no mapping", disk.storage.name)))
            })
            .collect()
    }

    async fn initialize(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let Some(found) = self.vm_inventory(plan_vm, vm).await? else {
            return Ok(StepOutcome::Fail(format!("VM '{}' not found in the inventory.", plan_vm.source.key())));
        };
        vm.id = found.vm.id().to_string();
        vm.name = found.vm.name().to_string();
        if vm.target_name.is_none() {
            vm.target_name = Some(dns_label(&vm.name));
        }
        if self.source.spec.type_.supports_power_ops() && vm.restore_power_state.is_none() {
            let state = self.call("read power state", self.adapter.power_state(&vm.id)).await?;
            vm.restore_power_state = Some(state);
        }
        Ok(StepOutcome::Done)
    }

    /// Request a power off once and report whether the VM is off
    pub(crate) async fn ensure_powered_off(&self, vm: &mut VmStatus, name: StepName) -> Result<bool, ControllerError> {
        if vm.restore_power_state == Some(PowerState::Off) {
            return Ok(true);
        }
        let vm_id = vm.id.clone();
        if self.call("read power state", self.adapter.power_state(&vm_id)).await? == PowerState::Off {
            if let Some(step) = vm.step_mut(name) {
                finish_task(step, POWER_OFF_TASK, StepPhase::Succeeded, None, self.now);
            }
            return Ok(true);
        }
        let requested = vm.step(name).is_some_and(|s| has_task(s, POWER_OFF_TASK));
        if !requested {
            info!("Powering off source VM {}", vm.source_ref().key());
            self.call("power off", self.adapter.power_off(&vm_id)).await?;
            if let Some(step) = vm.step_mut(name) {
                begin_task(step, POWER_OFF_TASK, self.now);
            }
        }
        Ok(false)
    }

    async fn power_off(&self, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        if vm.restore_power_state == Some(PowerState::Off) {
            return Ok(StepOutcome::Skip("AlreadyOff"));
        }
        Ok(match self.ensure_powered_off(vm, StepName::PowerOff).await? {
            true => StepOutcome::Done,
            false => StepOutcome::Wait,
        })
    }

    async fn create_snapshot(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let vm_id = vm.id.clone();
        let started = vm.step(StepName::CreateSnapshot).is_some_and(|s| !s.tasks.is_empty());
        if !started {
            let inventory = self.require_inventory(plan_vm, vm).await?;
            let disk_ids: Vec<String> = inventory.disks.iter().map(|d| d.id.clone()).collect();
            let label = format!("forklift-migration-{}", uid_prefix(self.migration_uid));
            let refs = self
                .call("create snapshot", self.adapter.create_snapshot(&vm_id, &disk_ids, &label))
                .await?;
            if refs.is_empty() {
                return Ok(StepOutcome::Skip("NoSnapshot"));
            }
            if let Some(step) = vm.step_mut(StepName::CreateSnapshot) {
                for snapshot in &refs {
                    begin_task(step, &snapshot.id, self.now);
                    if let (Some(disk), Some(task)) = (&snapshot.disk_id, step.tasks.last_mut()) {
                        task.annotations.insert(labels::DISK_ID.to_string(), disk.clone());
                    }
                }
            }
        }

        let pending: Vec<SnapshotRef> = vm
            .step(StepName::CreateSnapshot)
            .map(|s| {
                s.tasks
                    .iter()
                    .filter(|t| !t.phase.is_terminal())
                    .map(|t| SnapshotRef { id: t.name.clone(), disk_id: t.annotations.get(labels::DISK_ID).cloned() })
                    .collect()
            })
            .unwrap_or_default();
        for snapshot in pending {
            let Some(ready) = self.call("poll snapshot", self.adapter.snapshot_ready(&vm_id, &snapshot)).await? else {
                continue;
            };
            vm.snapshots.push(ready);
            if let Some(step) = vm.step_mut(StepName::CreateSnapshot) {
                finish_task(step, &snapshot.id, StepPhase::Succeeded, None, self.now);
            }
        }

        let tasks = vm.step(StepName::CreateSnapshot).map(|s| s.tasks.as_slice()).unwrap_or_default();
        if phase_of(tasks) != StepPhase::Succeeded {
            return Ok(StepOutcome::Wait);
        }
        if self.plan.spec.migration_type() == MigrationType::Warm {
            let snapshot = vm.snapshots.last().map(|s| s.id.clone()).unwrap_or_default();
            vm.warm.get_or_insert_with(Default::default).precopies.push(Precopy {
                start: Some(self.now),
                end: None,
                snapshot,
            });
        }
        Ok(StepOutcome::Done)
    }

    /// Copy the source credentials next to the target objects; returns the secret name, empty
    /// when the provider has no credentials
    async fn ensure_secret(&self, ctx: &VmContext<'_>) -> Result<String, ControllerError> {
        if self.secret.is_empty() {
            return Ok(String::new());
        }
        let secret = to_dynamic(&build_transfer_secret(ctx, self.secret))?;
        let applied = self
            .call("apply transfer secret", self.cluster.apply(ScratchKind::Secret, ctx.namespace(), secret))
            .await?;
        Ok(applied.name_any())
    }

    /// Find or create the claim of one disk; returns its name
    async fn ensure_claim(
        &self,
        ctx: &VmContext<'_>,
        volume: &DiskVolume<'_>,
        data_source: Option<k8s_openapi::api::core::v1::TypedObjectReference>,
    ) -> Result<String, ControllerError> {
        let selector = disk_selector(ctx, volume.disk);
        let existing = self.call("list claims", self.cluster.list(ScratchKind::Pvc, ctx.namespace(), &selector)).await?;
        if let Some(claim) = existing.first() {
            return Ok(claim.name_any());
        }
        let naming = DiskNaming { index: volume.index, file: &volume.disk.file, shared: volume.disk.shared };
        let name = claim_name(ctx, &naming)?;
        let claim = to_dynamic(&build_claim(ctx, volume, &name, data_source))?;
        let created = self.call("create claim", self.cluster.apply(ScratchKind::Pvc, ctx.namespace(), claim)).await?;
        debug!("Claim {} for disk {}", created.name_any(), volume.disk.id);
        Ok(created.name_any())
    }

    async fn create_volumes(&self, plan_vm: &PlanVm, vm: &VmStatus) -> Result<StepOutcome, ControllerError> {
        let inventory = self.require_inventory(plan_vm, vm).await?;
        let volumes = self.destinations(&inventory.disks)?;
        let ctx = self.ctx(plan_vm, vm);
        let secret_name = self.ensure_secret(&ctx).await?;

        match vm.transfer_method {
            TransferMethod::V2v => {
                for volume in &volumes {
                    self.ensure_claim(&ctx, volume, None).await?;
                }
            }
            TransferMethod::Populator => {
                for volume in &volumes {
                    let populator = populator_kind(self.source.spec.type_, volume.destination).ok_or_else(|| {
                        ControllerError::Validation(format!("no populator for {} disks", self.source.spec.type_))
                    })?;
                    let name = ctx.disk_object_name(volume.index);
                    let claim = self.ensure_claim(&ctx, volume, Some(data_source_ref(populator, &name))).await?;
                    let namespace = ctx.namespace();
                    let kind = ScratchKind::Populator(populator);
                    if self.call("get populator", self.cluster.get(kind, namespace, &name)).await?.is_some() {
                        continue;
                    }
                    let inputs = PopulatorInputs {
                        provider: self.source,
                        secret_name: &secret_name,
                        vm_id: &vm.id,
                        snapshots: &vm.snapshots,
                        claim_name: &claim,
                    };
                    let obj = build_populator(&ctx, populator, volume, &inputs)?;
                    self.call("create populator", self.cluster.apply(kind, namespace, obj)).await?;
                }
            }
            TransferMethod::DataVolume => {
                for volume in &volumes {
                    self.ensure_data_volume(&ctx, &inventory.vm, volume, &secret_name).await?;
                }
            }
        }
        Ok(StepOutcome::Done)
    }

    async fn ensure_data_volume(
        &self,
        ctx: &VmContext<'_>,
        source_vm: &SourceVm,
        volume: &DiskVolume<'_>,
        secret_name: &str,
    ) -> Result<(), ControllerError> {
        let selector = disk_selector(ctx, volume.disk);
        let namespace = ctx.namespace();
        if !self.call("list data volumes", self.cluster.list(ScratchKind::DataVolume, namespace, &selector)).await?.is_empty() {
            return Ok(());
        }
        let naming = DiskNaming { index: volume.index, file: &volume.disk.file, shared: volume.disk.shared };
        let name = match claim_name(ctx, &naming)? {
            ClaimName::Fixed(name) => name,
            ClaimName::Prefix(prefix) => {
                format!("{}{}", prefix, self.migration_uid.chars().take(5).collect::<String>())
            }
        };
        let provider = &self.source.spec;
        let source = match source_vm {
            SourceVm::VSphere(v) => DataVolumeSource::Vddk {
                url: provider.url.clone(),
                uuid: v.uuid.clone(),
                backing_file: volume.disk.file.clone(),
                secret: secret_name.to_string(),
                init_image: provider.settings.get(settings::VDDK_INIT_IMAGE).cloned(),
            },
            SourceVm::OVirt(_) => DataVolumeSource::Imageio {
                url: provider.url.clone(),
                disk_id: volume.disk.id.clone(),
                secret: secret_name.to_string(),
            },
            SourceVm::OpenShift(v) => DataVolumeSource::Pvc { namespace: v.namespace.clone(), name: volume.disk.id.clone() },
            _ => {
                return Err(ControllerError::Validation(format!(
                    "{} disks cannot be imported by a DataVolume",
                    provider.type_
                )))
            }
        };
        let checkpoints = super::warm::checkpoints(ctx.vm);
        let obj = build_data_volume(ctx, volume, &name, &source, &checkpoints)?;
        self.call("create data volume", self.cluster.apply(ScratchKind::DataVolume, namespace, obj)).await?;
        Ok(())
    }

    async fn run_hook(&self, plan_vm: &PlanVm, vm: &VmStatus, step: HookStep) -> Result<StepOutcome, ControllerError> {
        let Some(reference) = plan_vm.hooks.iter().find(|h| h.step == step) else {
            return Ok(StepOutcome::Skip("NoHook"));
        };
        let plan_namespace = self.plan.namespace().unwrap_or_default();
        let key = format!("{}/{}", reference.hook.namespace_or(&plan_namespace), reference.hook.name);
        let Some(hook) = self.hooks.get(&key) else {
            return Ok(StepOutcome::Fail(format!("Hook '{}' not found.", key)));
        };
        let ctx = self.ctx(plan_vm, vm);
        let name = hook_object_name(&ctx, step);
        let namespace = ctx.namespace();

        if let Some(job) = self.call("get hook job", self.cluster.get(ScratchKind::Job, namespace, &name)).await? {
            return Ok(match job_outcome(&from_dynamic::<Job>(&job)?) {
                RunOutcome::Running => StepOutcome::Wait,
                RunOutcome::Succeeded => StepOutcome::Done,
                RunOutcome::Failed(message) => StepOutcome::Fail(format!("Hook '{}' failed: {}", key, message)),
            });
        }

        let workload = serde_json::to_value(vm)?;
        let run = HookRun { hook, step, workload: &workload, backoff_limit: self.config.hook_backoff_limit };
        let config_map = to_dynamic(&build_hook_config_map(&ctx, &run)?)?;
        self.call("apply hook config", self.cluster.apply(ScratchKind::ConfigMap, namespace, config_map))
            .await?;
        let job = to_dynamic(&build_hook_job(&ctx, &run))?;
        self.call("create hook job", self.cluster.apply(ScratchKind::Job, namespace, job)).await?;
        info!("Started {} hook {} for VM {}", step.as_str(), key, vm.source_ref().key());
        Ok(StepOutcome::Wait)
    }

    /// DataVolume of each disk, `None` for disks whose DataVolume is missing
    pub(crate) async fn disk_data_volumes(
        &self,
        ctx: &VmContext<'_>,
        disks: &[SourceDisk],
    ) -> Result<Vec<Option<DynamicObject>>, ControllerError> {
        let mut out = Vec::with_capacity(disks.len());
        for disk in disks {
            let selector = disk_selector(ctx, disk);
            let mut found = self
                .call("list data volumes", self.cluster.list(ScratchKind::DataVolume, ctx.namespace(), &selector))
                .await?;
            out.push(found.pop());
        }
        Ok(out)
    }

    /// Cold and live disk transfer: follow populators or DataVolumes
    async fn transfer(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let inventory = self.require_inventory(plan_vm, vm).await?;
        let mut updates: Vec<(String, Progress, Option<(StepPhase, Option<String>)>)> = Vec::new();
        {
            let ctx = self.ctx(plan_vm, vm);
            match vm.transfer_method {
                TransferMethod::Populator => {
                    for volume in self.destinations(&inventory.disks)? {
                        let Some(kind) = populator_kind(self.source.spec.type_, volume.destination) else {
                            return Ok(StepOutcome::Fail(format!("No populator for disk {}.", volume.disk.id)));
                        };
                        let name = ctx.disk_object_name(volume.index);
                        let obj = self
                            .call("get populator", self.cluster.get(ScratchKind::Populator(kind), ctx.namespace(), &name))
                            .await?;
                        let Some(obj) = obj else {
                            return Ok(StepOutcome::Fail(format!("Populator {} is missing.", name)));
                        };
                        let status = populator_status(&obj);
                        let progress = Progress {
                            completed: to_mib(status.transferred),
                            total: capacity_mib(volume.disk),
                        };
                        let end = match status.phase {
                            PopulatorPhase::Succeeded => Some((StepPhase::Succeeded, None)),
                            PopulatorPhase::Failed => Some((StepPhase::Failed, status.failure.clone())),
                            PopulatorPhase::Pending | PopulatorPhase::Running => None,
                        };
                        updates.push((volume.disk.id.clone(), progress, end));
                    }
                }
                TransferMethod::DataVolume => {
                    let data_volumes = self.disk_data_volumes(&ctx, &inventory.disks).await?;
                    for (disk, data_volume) in inventory.disks.iter().zip(data_volumes) {
                        let Some(data_volume) = data_volume else {
                            return Ok(StepOutcome::Fail(format!("DataVolume of disk {} is missing.", disk.id)));
                        };
                        let (progress, end) = data_volume_progress(disk, &data_volume);
                        updates.push((disk.id.clone(), progress, end));
                    }
                }
                TransferMethod::V2v => return Ok(StepOutcome::Fail("virt-v2v transfers run in DiskTransferV2v.".into())),
            }
        }
        Ok(self.apply_task_updates(vm, StepName::DiskTransfer, updates))
    }

    /// Merge per-disk progress into a step and derive the outcome from its tasks
    pub(crate) fn apply_task_updates(
        &self,
        vm: &mut VmStatus,
        name: StepName,
        updates: Vec<(String, Progress, Option<(StepPhase, Option<String>)>)>,
    ) -> StepOutcome {
        let Some(step) = vm.step_mut(name) else {
            return StepOutcome::Wait;
        };
        for (task, progress, end) in updates {
            report(step, &task, progress, self.now);
            if let Some((phase, error)) = end {
                finish_task(step, &task, phase, error, self.now);
            }
        }
        match phase_of(&step.tasks) {
            StepPhase::Succeeded => StepOutcome::Done,
            StepPhase::Failed => {
                let errors: Vec<String> = step
                    .tasks
                    .iter()
                    .filter(|t| t.phase == StepPhase::Failed)
                    .map(|t| format!("{}: {}", t.name, t.error.as_deref().unwrap_or("failed")))
                    .collect();
                StepOutcome::Fail(errors.join("; "))
            }
            StepPhase::Pending | StepPhase::Running | StepPhase::Skipped => StepOutcome::Wait,
        }
    }

    /// Target claims in disk order
    async fn target_claims(&self, plan_vm: &PlanVm, vm: &VmStatus, inventory: &VmInventory) -> Result<Vec<AttachedClaim>, ControllerError> {
        let ctx = self.ctx(plan_vm, vm);
        let mut claims = Vec::with_capacity(inventory.disks.len());
        if self.plan.spec.migration_type() == MigrationType::Conversion {
            for (index, disk) in inventory.disks.iter().enumerate() {
                let naming = DiskNaming { index, file: &disk.file, shared: disk.shared };
                let ClaimName::Fixed(name) = claim_name(&ctx, &naming)? else {
                    return Err(ControllerError::Validation(
                        "conversion-only migrations need a PVC name template without generateName".into(),
                    ));
                };
                let claim = self
                    .call("get claim", self.cluster.get(ScratchKind::Pvc, ctx.namespace(), &name))
                    .await?
                    .ok_or_else(|| ControllerError::NotFound(format!("claim {}", name)))?;
                let claim: PersistentVolumeClaim = from_dynamic(&claim)?;
                let block = claim.spec.and_then(|s| s.volume_mode).is_some_and(|m| m == "Block");
                claims.push(AttachedClaim { name, block });
            }
            return Ok(claims);
        }

        let kind = match vm.transfer_method {
            TransferMethod::DataVolume => ScratchKind::DataVolume,
            TransferMethod::Populator | TransferMethod::V2v => ScratchKind::Pvc,
        };
        for volume in self.destinations(&inventory.disks)? {
            let selector = disk_selector(&ctx, volume.disk);
            let found = self.call("list claims", self.cluster.list(kind, ctx.namespace(), &selector)).await?;
            let name = found
                .first()
                .map(|obj| obj.name_any())
                .ok_or_else(|| ControllerError::NotFound(format!("claim of disk {}", volume.disk.id)))?;
            claims.push(AttachedClaim { name, block: is_block(volume.destination) });
        }
        Ok(claims)
    }

    /// virt-v2v run: copy and convert (`in_place == false`) or convert claims already filled
    async fn convert(&self, plan_vm: &PlanVm, vm: &mut VmStatus, in_place: bool) -> Result<StepOutcome, ControllerError> {
        let name = if in_place { StepName::GuestConversion } else { StepName::DiskTransferV2v };
        let inventory = self.require_inventory(plan_vm, vm).await?;
        let claims = self.target_claims(plan_vm, vm, &inventory).await?;
        let ctx = self.ctx(plan_vm, vm);
        let pod_name = ctx.role_name("v2v");
        let namespace = ctx.namespace().to_string();

        let Some(pod) = self.call("get conversion pod", self.cluster.get(ScratchKind::Pod, &namespace, &pod_name)).await? else {
            let secret_name = match self.plan.spec.migration_type() {
                MigrationType::Conversion => String::new(),
                _ if self.secret.is_empty() => String::new(),
                _ => ctx.role_name("source"),
            };
            let disk_files: Vec<String> = inventory.disks.iter().map(|d| d.file.clone()).collect();
            let inputs = ConversionInputs {
                provider: self.source,
                image: &self.config.virt_v2v_image,
                secret_name: &secret_name,
                claims: &claims,
                in_place,
                disk_files: &disk_files,
            };
            let pod = to_dynamic(&build_conversion_pod(&ctx, &inputs)?)?;
            self.call("create conversion pod", self.cluster.apply(ScratchKind::Pod, &namespace, pod)).await?;
            info!("Started conversion pod {}/{}", namespace, pod_name);
            if !in_place {
                if let Some(step) = vm.step_mut(name) {
                    for disk in &inventory.disks {
                        report(step, &disk.id, Progress { completed: 0, total: capacity_mib(disk) }, self.now);
                    }
                }
            }
            return Ok(StepOutcome::Wait);
        };

        Ok(match pod_outcome(&from_dynamic::<Pod>(&pod)?) {
            RunOutcome::Running => StepOutcome::Wait,
            RunOutcome::Succeeded => {
                if let Some(step) = vm.step_mut(name) {
                    let tasks: Vec<String> = step.tasks.iter().map(|t| t.name.clone()).collect();
                    for task in tasks {
                        finish_task(step, &task, StepPhase::Succeeded, None, self.now);
                    }
                }
                StepOutcome::Done
            }
            RunOutcome::Failed(message) => StepOutcome::Fail(message),
        })
    }

    async fn create_vm(&self, plan_vm: &PlanVm, vm: &VmStatus) -> Result<StepOutcome, ControllerError> {
        let ctx = self.ctx(plan_vm, vm);
        let name = ctx.target_name();
        let existing = self
            .call("get virtual machine", self.cluster.get(ScratchKind::VirtualMachine, ctx.namespace(), &name))
            .await?;
        if existing.is_some() {
            return Ok(StepOutcome::Done);
        }
        let inventory = self.require_inventory(plan_vm, vm).await?;
        let claims: Vec<String> = self
            .target_claims(plan_vm, vm, &inventory)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let shape = guest_shape(&inventory.vm, self.plan.spec.preserve_cluster_cpu_model);
        let nics: Vec<TargetNic> = inventory
            .nics
            .iter()
            .zip(nic_destinations(&inventory.nics, self.network_pairs))
            .map(|(nic, destination)| TargetNic { mac: nic.mac.clone(), destination })
            .collect();
        let obj = build_virtual_machine(&ctx, &shape, &claims, &nics)?;
        self.call("create virtual machine", self.cluster.apply(ScratchKind::VirtualMachine, ctx.namespace(), obj))
            .await?;
        info!("Created VirtualMachine {}/{}", ctx.namespace(), name);
        Ok(StepOutcome::Done)
    }

    /// Drop source snapshots and scratch workloads; claims, DataVolumes and the VM stay
    async fn finalize(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let vm_id = vm.id.clone();
        while let Some(snapshot) = vm.snapshots.first().cloned() {
            self.call("remove snapshot", self.adapter.remove_snapshot(&vm_id, &snapshot)).await?;
            vm.snapshots.remove(0);
        }
        let selector = self.ctx(plan_vm, vm).selector();
        let mut kinds = vec![ScratchKind::Pod, ScratchKind::Job, ScratchKind::ConfigMap];
        kinds.extend(self.populator_kinds(vm).into_iter().map(ScratchKind::Populator));
        for kind in kinds {
            self.delete_selected(kind, &selector).await?;
        }
        Ok(StepOutcome::Done)
    }
}

fn is_block(destination: &StorageDestination) -> bool {
    destination.volume_mode == Some(VolumeMode::Block)
}

/// `percent` of `total`, clamped to `0..=total`
pub(crate) fn percent_of(total: i64, percent: f64) -> i64 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    if percent >= 100.0 {
        return total;
    }
    let value = (percent / 100.0 * total as f64).floor();
    if value >= total as f64 { total } else { value as i64 }
}

/// Progress of a DataVolume in MiB and its end state
pub(crate) fn data_volume_progress(
    disk: &SourceDisk,
    data_volume: &DynamicObject,
) -> (Progress, Option<(StepPhase, Option<String>)>) {
    let state = data_volume_state(data_volume);
    let total = capacity_mib(disk);
    let completed = state.percent.map_or(0, |p| percent_of(total, p));
    let end = if state.succeeded() {
        Some((StepPhase::Succeeded, None))
    } else if state.failed() {
        Some((StepPhase::Failed, Some(format!("DataVolume {} failed", data_volume.name_any()))))
    } else {
        None
    };
    (Progress { completed, total }, end)
}
