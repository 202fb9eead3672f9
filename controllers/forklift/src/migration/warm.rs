//! Warm migration: precopy rounds while the source runs, then the cutover.
//!
//! Every round is a [`Precopy`] in the VM's warm status. A round starts with a source
//! snapshot; once the snapshot is ready its checkpoint is appended to every DataVolume, and
//! the round ends when all DataVolumes pause. The snapshot of a precopy whose round has not
//! produced a ready snapshot yet is not in `VmStatus::snapshots`.

use super::steps::{data_volume_progress, task_done, StepOutcome, POWER_OFF_TASK};
use super::Run;
use crate::builder::uid_prefix;
use crate::builder::volume::{checkpoint_patch, data_volume_state, Checkpoint};
use crate::cluster::ScratchKind;
use crate::error::ControllerError;
use crate::pipeline::{begin_task, finish_task, has_task, report};
use crate::mapping::SourceDisk;
use crds::{PlanVm, Precopy, SnapshotRef, StepName, StepPhase, VmStatus};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Snapshot failures tolerated before the VM fails
pub(crate) const MAX_PRECOPY_FAILURES: u32 = 3;

const SNAPSHOT_TASK: &str = "Snapshot";
const TRANSFER_TASK: &str = "Transfer";

/// Last checkpoint the importer copied
const CHECKPOINT_COPIED: &str = "cdi.kubevirt.io/storage.checkpoint.copied";

/// The importer paused after copying `snapshot`
fn round_finished(data_volume: &DynamicObject, snapshot: &str) -> bool {
    data_volume_state(data_volume).paused()
        && data_volume.annotations().get(CHECKPOINT_COPIED).is_none_or(|copied| copied == snapshot)
}

/// Checkpoints of the rounds whose snapshot is ready, in order
pub(crate) fn checkpoints(vm: &VmStatus) -> Vec<Checkpoint> {
    let Some(warm) = &vm.warm else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut previous = String::new();
    for precopy in &warm.precopies {
        if precopy.end.is_none() && !vm.snapshots.iter().any(|s| s.id == precopy.snapshot) {
            break;
        }
        out.push(Checkpoint { previous: previous.clone(), current: precopy.snapshot.clone() });
        previous = precopy.snapshot.clone();
    }
    out
}

/// Snapshot of the current round that is still being taken
pub(crate) fn awaiting(vm: &VmStatus) -> Option<SnapshotRef> {
    let precopy = vm.warm.as_ref()?.precopies.last()?;
    if precopy.end.is_some() || vm.snapshots.iter().any(|s| s.id == precopy.snapshot) {
        return None;
    }
    Some(SnapshotRef { id: precopy.snapshot.clone(), disk_id: None })
}

fn current_round(vm: &mut VmStatus) -> Option<&mut Precopy> {
    vm.warm.as_mut()?.precopies.last_mut()
}

impl Run<'_> {
    fn snapshot_label(&self) -> String {
        format!("forklift-migration-{}", uid_prefix(self.migration_uid))
    }

    /// Disks of the VM with their DataVolumes; a missing DataVolume is a failure message
    async fn data_volumes(
        &self,
        plan_vm: &PlanVm,
        vm: &VmStatus,
    ) -> Result<Result<(Vec<SourceDisk>, Vec<DynamicObject>), String>, ControllerError> {
        let inventory = self.require_inventory(plan_vm, vm).await?;
        let ctx = self.ctx(plan_vm, vm);
        let mut out = Vec::new();
        for (disk, found) in inventory.disks.iter().zip(self.disk_data_volumes(&ctx, &inventory.disks).await?) {
            match found {
                Some(data_volume) => out.push(data_volume),
                None => return Ok(Err(format!("DataVolume of disk {} is missing.", disk.id))),
            }
        }
        Ok(Ok((inventory.disks, out)))
    }

    /// Report per-disk progress of the DataVolumes without finishing the tasks
    fn report_progress(&self, vm: &mut VmStatus, disks: &[SourceDisk], data_volumes: &[DynamicObject]) {
        let Some(step) = vm.step_mut(StepName::DiskTransfer) else {
            return;
        };
        for (disk, data_volume) in disks.iter().zip(data_volumes) {
            report(step, &disk.id, data_volume_progress(disk, data_volume).0, self.now);
        }
    }

    async fn patch_checkpoints(&self, data_volumes: &[DynamicObject], vm: &VmStatus, final_checkpoint: bool) -> Result<(), ControllerError> {
        let patch = checkpoint_patch(&checkpoints(vm), final_checkpoint)?;
        for data_volume in data_volumes {
            let name = data_volume.name_any();
            self.call(
                "patch checkpoints",
                self.cluster.patch(ScratchKind::DataVolume, self.namespace(), &name, &patch),
            )
            .await?;
        }
        Ok(())
    }

    /// Poll the snapshot of the current round; once ready it becomes the round's checkpoint.
    ///
    /// Returns true when a snapshot became ready in this call.
    async fn resolve_snapshot(&self, vm: &mut VmStatus, pending: &SnapshotRef) -> Result<bool, ControllerError> {
        let vm_id = vm.id.clone();
        let Some(ready) = self.call("poll snapshot", self.adapter.snapshot_ready(&vm_id, pending)).await? else {
            return Ok(false);
        };
        if let Some(round) = current_round(vm) {
            round.snapshot = ready.id.clone();
        }
        vm.snapshots.push(ready);
        Ok(true)
    }

    pub(crate) fn precopy_failure(&self, vm: &mut VmStatus, error: ControllerError) -> StepOutcome {
        let key = vm.source_ref().key().to_owned();
        let pending = awaiting(vm).is_some();
        let Some(warm) = vm.warm.as_mut() else {
            return StepOutcome::Fail(error.to_string());
        };
        warm.failures += 1;
        if pending {
            warm.precopies.pop();
        }
        warn!("Precopy of VM {} failed ({} of {}): {}", key, warm.failures, MAX_PRECOPY_FAILURES, error);
        if warm.failures >= MAX_PRECOPY_FAILURES {
            return StepOutcome::Fail(format!("Precopy failed {} times: {}", warm.failures, error));
        }
        StepOutcome::Wait
    }

    /// Warm DiskTransfer: one precopy round at a time until the cutover time
    pub(crate) async fn precopy(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let (disks, data_volumes) = match self.data_volumes(plan_vm, vm).await? {
            Ok(found) => found,
            Err(message) => return Ok(StepOutcome::Fail(message)),
        };
        if let Some(failed) = data_volumes.iter().find(|dv| data_volume_state(dv).failed()) {
            return Ok(StepOutcome::Fail(format!("DataVolume {} failed.", failed.name_any())));
        }
        self.report_progress(vm, &disks, &data_volumes);
        if self.cutover_reached() {
            info!("Cutover time reached for VM {}", vm.source_ref().key());
            return Ok(StepOutcome::Done);
        }

        if let Some(pending) = awaiting(vm) {
            match self.resolve_snapshot(vm, &pending).await {
                Ok(true) => self.patch_checkpoints(&data_volumes, vm, false).await?,
                Ok(false) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => return Ok(self.precopy_failure(vm, e)),
            }
            return Ok(StepOutcome::Wait);
        }

        let vm_id = vm.id.clone();
        let open_round = current_round(vm).filter(|r| r.end.is_none()).map(|r| r.snapshot.clone());
        if let Some(snapshot) = open_round {
            if !data_volumes.iter().all(|dv| round_finished(dv, &snapshot)) {
                return Ok(StepOutcome::Wait);
            }
            let interval = chrono::Duration::from_std(self.config.precopy_interval).unwrap_or_else(|_| chrono::Duration::hours(1));
            if let Some(round) = current_round(vm) {
                round.end = Some(self.now);
            }
            if let Some(warm) = vm.warm.as_mut() {
                warm.successes += 1;
                warm.next_precopy_at = Some(self.now + interval);
            }
            debug!("Precopy round of VM {} ended", vm.source_ref().key());
            let keep = current_round(vm).map(|r| r.snapshot.clone()).unwrap_or_default();
            let stale: Vec<SnapshotRef> = vm.snapshots.iter().filter(|s| s.id != keep).cloned().collect();
            for snapshot in stale {
                self.call("remove snapshot", self.adapter.remove_snapshot(&vm_id, &snapshot)).await?;
                vm.snapshots.retain(|s| s.id != snapshot.id);
            }
            return Ok(StepOutcome::Wait);
        }

        let due = vm
            .warm
            .as_ref()
            .and_then(|w| w.next_precopy_at)
            .is_none_or(|at| self.now >= at);
        if !due {
            return Ok(StepOutcome::Wait);
        }
        match self.call("create snapshot", self.adapter.create_snapshot(&vm_id, &[], &self.snapshot_label())).await {
            Ok(refs) => {
                let Some(snapshot) = refs.into_iter().next() else {
                    return Ok(StepOutcome::Fail("The source returned no snapshot.".into()));
                };
                info!("Precopy round started for VM {}", vm.source_ref().key());
                vm.warm.get_or_insert_with(Default::default).precopies.push(Precopy {
                    start: Some(self.now),
                    end: None,
                    snapshot: snapshot.id,
                });
                Ok(StepOutcome::Wait)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => Ok(self.precopy_failure(vm, e)),
        }
    }

    /// Cutover: power off, take the final snapshot, mark the final checkpoint and wait for the
    /// DataVolumes to finish
    pub(crate) async fn cutover(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<StepOutcome, ControllerError> {
        let (_, data_volumes) = match self.data_volumes(plan_vm, vm).await? {
            Ok(found) => found,
            Err(message) => return Ok(StepOutcome::Fail(message)),
        };

        if !task_done(vm, StepName::Cutover, POWER_OFF_TASK) {
            if self.source.spec.type_.supports_power_ops() && !self.ensure_powered_off(vm, StepName::Cutover).await? {
                return Ok(StepOutcome::Wait);
            }
            if let Some(step) = vm.step_mut(StepName::Cutover) {
                begin_task(step, POWER_OFF_TASK, self.now);
                finish_task(step, POWER_OFF_TASK, StepPhase::Succeeded, None, self.now);
            }
        }

        if !task_done(vm, StepName::Cutover, SNAPSHOT_TASK) {
            if let Some(pending) = awaiting(vm) {
                if !self.resolve_snapshot(vm, &pending).await? {
                    return Ok(StepOutcome::Wait);
                }
            }
            let requested = vm.step(StepName::Cutover).is_some_and(|s| has_task(s, SNAPSHOT_TASK));
            if !requested {
                let vm_id = vm.id.clone();
                let refs = self
                    .call("create snapshot", self.adapter.create_snapshot(&vm_id, &[], &self.snapshot_label()))
                    .await?;
                let snapshot = refs
                    .into_iter()
                    .next()
                    .ok_or_else(|| ControllerError::Validation("the source returned no snapshot".into()))?;
                vm.warm.get_or_insert_with(Default::default).precopies.push(Precopy {
                    start: Some(self.now),
                    end: None,
                    snapshot: snapshot.id,
                });
                if let Some(step) = vm.step_mut(StepName::Cutover) {
                    begin_task(step, SNAPSHOT_TASK, self.now);
                }
                return Ok(StepOutcome::Wait);
            }
            self.patch_checkpoints(&data_volumes, vm, true).await?;
            info!("Final checkpoint set for VM {}", vm.source_ref().key());
            if let Some(step) = vm.step_mut(StepName::Cutover) {
                finish_task(step, SNAPSHOT_TASK, StepPhase::Succeeded, None, self.now);
                begin_task(step, TRANSFER_TASK, self.now);
            }
            return Ok(StepOutcome::Wait);
        }

        if let Some(failed) = data_volumes.iter().find(|dv| data_volume_state(dv).failed()) {
            return Ok(StepOutcome::Fail(format!("DataVolume {} failed.", failed.name_any())));
        }
        if !data_volumes.iter().all(|dv| data_volume_state(dv).succeeded()) {
            return Ok(StepOutcome::Wait);
        }
        if let Some(round) = current_round(vm) {
            round.end.get_or_insert(self.now);
        }
        if let Some(step) = vm.step_mut(StepName::Cutover) {
            finish_task(step, TRANSFER_TASK, StepPhase::Succeeded, None, self.now);
        }
        Ok(StepOutcome::Done)
    }
}
