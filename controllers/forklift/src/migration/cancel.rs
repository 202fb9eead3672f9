//! Cancellation of whole migrations and of single VMs.
//!
//! In-flight workloads (populators, conversion pods, hook jobs, unfinished DataVolume imports)
//! are deleted; claims and finished imports stay.

use super::Run;
use crate::builder::migration_selector;
use crate::builder::volume::data_volume_state;
use crate::cluster::ScratchKind;
use crate::error::ControllerError;
use crate::pipeline::skip;
use chrono::{DateTime, Utc};
use crds::{MigrationPhase, MigrationStatus, PlanVm, PopulatorKind, VmOutcome, VmStatus};
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, info};

/// Reason recorded on the steps a cancellation interrupted
const CANCELED_REASON: &str = "Canceled";

/// Mark a VM canceled; its running step is closed with the cancellation reason
pub fn mark_canceled(vm: &mut VmStatus, now: DateTime<Utc>) {
    for step in vm.pipeline.iter_mut().filter(|s| !s.phase.is_terminal()) {
        skip(step, CANCELED_REASON, now);
    }
    vm.outcome = Some(VmOutcome::Canceled);
    vm.completed = Some(now);
}

/// True once `grace` passed since the cancellation was requested
pub fn grace_elapsed(requested: Option<DateTime<Utc>>, grace: Duration, now: DateTime<Utc>) -> bool {
    requested.is_some_and(|at| (now - at).to_std().is_ok_and(|elapsed| elapsed >= grace))
}

impl Run<'_> {
    fn inflight_kinds(&self, vms: &[&VmStatus]) -> Vec<ScratchKind> {
        let mut populators: Vec<PopulatorKind> = vms.iter().flat_map(|vm| self.populator_kinds(vm)).collect();
        populators.sort_by_key(|k| k.kind());
        populators.dedup();
        let mut kinds = vec![ScratchKind::Pod, ScratchKind::Job];
        kinds.extend(populators.into_iter().map(ScratchKind::Populator));
        if vms.iter().any(|vm| vm.transfer_method == crds::TransferMethod::DataVolume) {
            kinds.push(ScratchKind::DataVolume);
        }
        kinds
    }

    /// Delete the in-flight objects matching a selector; returns how many were found
    async fn cancel_objects(&self, kinds: &[ScratchKind], selector: &str) -> Result<usize, ControllerError> {
        let mut found = 0;
        for kind in kinds {
            let objects = self.call("list objects", self.cluster.list(*kind, self.namespace(), selector)).await?;
            for obj in objects {
                if *kind == ScratchKind::DataVolume && data_volume_state(&obj).succeeded() {
                    continue;
                }
                let name = obj.name_any();
                debug!("Canceling {} {}/{}", kind.kind(), self.namespace(), name);
                self.call("delete object", self.cluster.delete(*kind, self.namespace(), &name)).await?;
                found += 1;
            }
        }
        Ok(found)
    }

    /// Cancel one VM of a running migration
    pub(crate) async fn cancel_vm(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<(), ControllerError> {
        let selector = self.ctx(plan_vm, vm).selector();
        let kinds = self.inflight_kinds(&[&*vm]);
        self.cancel_objects(&kinds, &selector).await?;
        mark_canceled(vm, self.now);
        Ok(())
    }

    /// One pass of a canceling migration. Returns true once the migration is Canceled: every
    /// in-flight object is gone or the grace period ran out.
    pub(crate) async fn cancel_migration(&self, status: &mut MigrationStatus) -> Result<bool, ControllerError> {
        if !grace_elapsed(status.cancel_requested, self.config.cancel_grace, self.now) {
            let active: Vec<&VmStatus> = status.vms.iter().filter(|vm| !vm.is_terminal()).collect();
            let kinds = self.inflight_kinds(&active);
            let remaining = self.cancel_objects(&kinds, &migration_selector(self.migration_uid)).await?;
            if remaining > 0 {
                debug!("{} objects of migration {} still being removed", remaining, self.migration_uid);
                return Ok(false);
            }
        }
        for vm in status.vms.iter_mut().filter(|vm| !vm.is_terminal()) {
            mark_canceled(vm, self.now);
        }
        info!("Migration {} canceled", self.migration_uid);
        status.phase = MigrationPhase::Canceled;
        status.completed = Some(self.now);
        Ok(true)
    }
}
