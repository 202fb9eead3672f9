//! Migration reconciliation.
//!
//! A reconcile either admits a pending migration (building one pipeline per plan VM) or drives
//! the pipelines of a running one a step further. Everything the engine needs for one pass is
//! gathered into a [`Run`]; its methods talk to the source through a [`SourceAdapter`] and to
//! the destination through a [`TargetCluster`], so the whole engine runs against in-memory
//! doubles in tests. The status is the only state carried between passes and is written back
//! with a compare-and-set, so a restarted controller resumes where the last write left off.

pub mod admission;
mod cancel;
mod steps;
mod warm;

pub use admission::{admit, cutover_decision, Admission, CutoverDecision};
pub use cancel::{grace_elapsed, mark_canceled};

use crate::adapter::{SecretData, SourceAdapter};
use crate::builder::{migration_selector, VmContext};
use crate::cluster::{ScratchKind, TargetCluster};
use crate::config::Config;
use crate::error::{with_timeout, ControllerError};
use crate::mapping::{source_family, SourceContext, SourceDisk, SourceNic};
use crate::metrics::MigrationLabels;
use crate::pipeline::transfer_method;
use crate::plan::{disk_destination, find_source_vm, target_namespace};
use crate::reconcile_helpers::{object_key, object_reference, StatusWrite};
use crate::reconciler::Reconciler;
use admission::{announce_cutover, pending_default_cutover, pipeline_context, vm_record};
use chrono::{DateTime, Utc};
use crds::{
    delete_condition, set_condition, types, Condition, Hook, Migration, MigrationHistory, MigrationPhase,
    MigrationStatus, NetworkMap, NetworkPair, Plan, PlanStatus, PlanVm, Provider, ResourceRef, StorageMap,
    StoragePair, VmOutcome, VmStatus,
};
use inventory_client::{InventoryClientTrait, SourceVm};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "migration_test.rs"]
mod migration_test;

/// Requeue delay after losing a status write race
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Final phase of a migration whose VMs are all terminal, `None` while any VM is still going
pub fn migration_outcome(vms: &[VmStatus]) -> Option<MigrationPhase> {
    if vms.iter().any(|vm| !vm.is_terminal()) {
        return None;
    }
    if vms.iter().any(|vm| vm.outcome == Some(VmOutcome::Failed)) {
        return Some(MigrationPhase::Failed);
    }
    if !vms.is_empty() && vms.iter().all(|vm| vm.outcome == Some(VmOutcome::Canceled)) {
        return Some(MigrationPhase::Canceled);
    }
    Some(MigrationPhase::Succeeded)
}

/// Plan status reflecting a migration: `Executing` while it runs, then the outcome condition
/// and a history entry (one per migration UID).
pub fn plan_outcome_status(plan: &Plan, migration: &Migration, status: &MigrationStatus, now: DateTime<Utc>) -> PlanStatus {
    let mut out = plan.status.clone().unwrap_or_default();
    for type_ in [types::EXECUTING, types::SUCCEEDED, types::FAILED, types::CANCELED] {
        delete_condition(&mut out.conditions, type_);
    }
    let name = migration.name_any();
    let outcome = match status.phase {
        MigrationPhase::Succeeded => types::SUCCEEDED,
        MigrationPhase::Failed => types::FAILED,
        MigrationPhase::Canceled => types::CANCELED,
        MigrationPhase::Pending | MigrationPhase::Running | MigrationPhase::Canceling => {
            let message = format!("Migration '{}' is running.", name);
            set_condition(&mut out.conditions, Condition::advisory(types::EXECUTING, "Started", message), now);
            return out;
        }
    };
    let message = format!("Migration '{}' {}.", name, status.phase.as_str().to_lowercase());
    set_condition(&mut out.conditions, Condition::advisory(outcome, status.phase.as_str(), message), now);

    let uid = migration.uid().unwrap_or_default();
    let history = &mut out.migration.history;
    history.retain(|entry| entry.uid != uid);
    history.push(MigrationHistory {
        migration: ResourceRef::with_namespace(name, migration.namespace().unwrap_or_default()),
        uid,
        result: status.phase.as_str().to_string(),
        started: status.started,
        completed: status.completed,
    });
    out
}

/// Source inventory of one VM
#[derive(Debug, Clone)]
pub(crate) struct VmInventory {
    pub vm: SourceVm,
    pub nics: Vec<SourceNic>,
    pub disks: Vec<SourceDisk>,
}

/// Everything one pass over a running migration needs
pub struct Run<'a> {
    /// Controller configuration
    pub config: &'a Config,
    /// The plan, with its target namespace resolved
    pub plan: &'a Plan,
    /// UID of the migration, stamped on every object it creates
    pub migration_uid: &'a str,
    /// Source provider
    pub source: &'a Provider,
    /// Source hypervisor
    pub adapter: &'a dyn SourceAdapter,
    /// Destination object store
    pub cluster: &'a dyn TargetCluster,
    /// Inventory service
    pub inventory: &'a dyn InventoryClientTrait,
    /// Network pairs of the plan
    pub network_pairs: &'a [NetworkPair],
    /// Storage pairs of the plan
    pub storage_pairs: &'a [StoragePair],
    /// Source provider credentials
    pub secret: &'a SecretData,
    /// Hooks referenced by the plan, keyed `namespace/name`
    pub hooks: &'a BTreeMap<String, Hook>,
    /// Cutover of a warm migration
    pub cutover: Option<DateTime<Utc>>,
    /// Time of this pass
    pub now: DateTime<Utc>,
}

impl<'a> Run<'a> {
    /// Run an external call under the per-call budget
    pub(crate) async fn call<T, E, F>(&self, what: &str, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, E>>,
        ControllerError: From<E>,
    {
        with_timeout(self.config.api_call_timeout, what, call).await
    }

    /// Namespace receiving the target objects
    pub fn namespace(&self) -> &str {
        &self.plan.spec.target_namespace
    }

    pub(crate) fn ctx<'v>(&'v self, plan_vm: &'v PlanVm, vm: &'v VmStatus) -> VmContext<'v> {
        VmContext { plan: self.plan, plan_vm, vm, migration_uid: self.migration_uid }
    }

    /// Plan entry of a VM record
    pub fn plan_vm(&self, vm: &VmStatus) -> Option<&'a PlanVm> {
        self.plan.spec.vms.iter().find(|p| p.source.matches(&vm.id, &vm.name))
    }

    pub(crate) fn cutover_reached(&self) -> bool {
        self.cutover.is_some_and(|at| self.now >= at)
    }

    /// The VM and its NICs and disks, `None` when the inventory no longer has it
    pub(crate) async fn vm_inventory(&self, plan_vm: &PlanVm, vm: &VmStatus) -> Result<Option<VmInventory>, ControllerError> {
        let reference = if vm.id.is_empty() { plan_vm.source.clone() } else { vm.source_ref() };
        let uid = self.source.uid().unwrap_or_default();
        let provider_type = self.source.spec.type_;
        let Some(source_vm) = self
            .call("find source VM", find_source_vm(self.inventory, provider_type, &uid, &reference))
            .await?
        else {
            return Ok(None);
        };
        let ctx = SourceContext { inventory: self.inventory, provider_type, provider_uid: &uid };
        let family = source_family(provider_type);
        let nics = self.call("list VM NICs", family.nics(&ctx, &source_vm)).await?;
        let disks = self.call("list VM disks", family.disks(&ctx, &source_vm)).await?;
        Ok(Some(VmInventory { vm: source_vm, nics, disks }))
    }

    /// Delete every object of `kind` matching a selector; returns how many were deleted
    pub(crate) async fn delete_selected(&self, kind: ScratchKind, selector: &str) -> Result<usize, ControllerError> {
        let mut deleted = 0;
        for obj in self.call("list objects", self.cluster.list(kind, self.namespace(), selector)).await? {
            let name = obj.name_any();
            if self.call("delete object", self.cluster.delete(kind, self.namespace(), &name)).await? {
                debug!("Deleted {} {}/{}", kind.kind(), self.namespace(), name);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Drive every VM of a running migration one pass further
    pub async fn execute(&self, status: &mut MigrationStatus, cancel_vms: &[crds::SourceRef]) -> Result<(), ControllerError> {
        for vm in status.vms.iter_mut().filter(|vm| !vm.is_terminal()) {
            if !cancel_vms.iter().any(|r| r.matches(&vm.id, &vm.name)) {
                continue;
            }
            info!("Canceling VM {} of migration {}", vm.source_ref().key(), self.migration_uid);
            if let Some(plan_vm) = self.plan_vm(vm) {
                self.cancel_vm(plan_vm, vm).await?;
            } else {
                mark_canceled(vm, self.now);
            }
        }

        let transferring = status
            .vms
            .iter()
            .filter(|vm| !vm.is_terminal())
            .filter(|vm| vm.pipeline.iter().any(|s| s.name.is_transfer() && s.phase == crds::StepPhase::Running))
            .count();
        let mut slots = self.config.max_vm_inflight.saturating_sub(transferring);
        for vm in status.vms.iter_mut().filter(|vm| !vm.is_terminal()) {
            let Some(plan_vm) = self.plan_vm(vm) else {
                warn!("VM {} is no longer part of the plan", vm.source_ref().key());
                vm.error = Some(crds::VmError {
                    phase: vm.phase.map(|p| p.as_str().to_string()).unwrap_or_default(),
                    reasons: vec!["VM was removed from the plan.".to_string()],
                });
                steps::complete_vm(vm, VmOutcome::Failed, self.now);
                continue;
            };
            self.drive_vm(plan_vm, vm, &mut slots).await?;
        }
        Ok(())
    }

    /// Remove the objects a finished migration no longer needs: credential copies and hook
    /// inputs. Claims, DataVolumes and VMs stay.
    pub async fn release(&self) -> Result<(), ControllerError> {
        let selector = migration_selector(self.migration_uid);
        for kind in [ScratchKind::Secret, ScratchKind::ConfigMap] {
            self.delete_selected(kind, &selector).await?;
        }
        Ok(())
    }
}

impl Reconciler {
    /// Reconcile one Migration
    pub async fn reconcile_migration(&self, migration: &Migration) -> Result<Action, ControllerError> {
        let key = object_key(migration);
        info!("Reconciling Migration {}", key);

        let current = migration.status.clone().unwrap_or_default();
        if current.phase.is_terminal() {
            self.reconciled(&key);
            return Ok(Action::await_change());
        }
        let now = Utc::now();
        let namespace = migration.namespace().unwrap_or_default();
        let plan = self.lookup::<Plan>(&migration.spec.plan, &namespace).await?;

        let mut status = current;
        status.observed_generation = migration.meta().generation;
        let (requeue, cutover) = match (status.phase, plan.as_ref()) {
            (MigrationPhase::Pending, _) => self.admit_migration(migration, plan.as_ref(), &mut status, now).await?,
            (_, Some(plan)) => (self.execute_migration(migration, plan, &mut status, now).await?, CutoverDecision::Keep),
            (_, None) => {
                let message = format!("Plan '{}' not found.", migration.spec.plan.name);
                let condition = Condition::critical(admission::conditions::PLAN_NOT_READY, "NotFound", message);
                set_condition(&mut status.conditions, condition, now);
                (Some(self.config.poll_interval), CutoverDecision::Keep)
            }
        };

        // The migration status goes first: it carries the resource version this pass read, and
        // nothing else is written when it lost a race
        if self.write_status(migration, migration.status.as_ref(), &status).await? == StatusWrite::Conflict {
            debug!("{}: status changed underneath, retrying", key);
            return Ok(Action::requeue(CONFLICT_REQUEUE));
        }
        let announced = migration.status.as_ref().is_some_and(|s| s.cutover_defaulted);
        announce_cutover(self.events.as_ref(), &object_reference(migration), cutover, announced).await;
        if let Some(at) = pending_default_cutover(migration.spec.cutover, &status) {
            let patch = serde_json::json!({ "spec": { "cutover": at } });
            self.call(
                "set default cutover",
                self.api::<Migration>(&namespace).patch(&migration.name_any(), &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;
        }
        if let Some(plan) = &plan {
            if status.phase != migration.phase() {
                let desired = plan_outcome_status(plan, migration, &status, now);
                self.write_status(plan, plan.status.as_ref(), &desired).await?;
            }
        }
        if status.phase.is_terminal() {
            info!("Migration {} {}", key, status.phase);
            self.record_completion(migration, plan.as_ref(), &status).await?;
        }
        self.reconciled(&key);
        Ok(requeue.map_or_else(Action::await_change, Action::requeue))
    }

    async fn admit_migration(
        &self,
        migration: &Migration,
        plan: Option<&Plan>,
        status: &mut MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<(Option<Duration>, CutoverDecision), ControllerError> {
        if migration.spec.cancel {
            info!("{} canceled before it started", object_key(migration));
            status.phase = MigrationPhase::Canceled;
            status.completed = Some(now);
            return Ok((None, CutoverDecision::Keep));
        }
        let namespace = migration.namespace().unwrap_or_default();
        let siblings = self
            .call("list migrations", self.api::<Migration>(&namespace).list(&ListParams::default()))
            .await?
            .items;
        let plan = match (admit(migration, plan, &siblings), plan) {
            (Admission::Admit, Some(plan)) => plan,
            (Admission::Reject(condition), _) => {
                warn!("{} rejected: {}", object_key(migration), condition.message);
                set_condition(&mut status.conditions, condition, now);
                status.phase = MigrationPhase::Failed;
                status.completed = Some(now);
                return Ok((None, CutoverDecision::Keep));
            }
            (Admission::Wait(condition), _) => {
                debug!("{} waiting: {}", object_key(migration), condition.message);
                set_condition(&mut status.conditions, condition, now);
                return Ok((Some(self.config.poll_interval), CutoverDecision::Keep));
            }
            (Admission::Admit, None) => return Ok((Some(self.config.poll_interval), CutoverDecision::Keep)),
        };
        delete_condition(&mut status.conditions, admission::conditions::PLAN_NOT_READY);
        delete_condition(&mut status.conditions, types::BLOCKED);

        let mode = plan.spec.migration_type();
        // The default is stored in the spec once this status is written
        let decision = cutover_decision(mode, migration.spec.cutover, now);
        if let CutoverDecision::Default(_) = decision {
            status.cutover_defaulted = true;
        }

        let source = self
            .lookup::<Provider>(&plan.spec.provider.source, &plan.namespace().unwrap_or_default())
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("provider {}", plan.spec.provider.source.name)))?;
        let (_, storage_pairs) = self.plan_pairs(plan).await?;
        for plan_vm in &plan.spec.vms {
            let offload = self.all_disks_offloaded(&source, plan_vm, &storage_pairs).await?;
            let transfer = transfer_method(source.spec.type_, mode, offload);
            status.vms.push(vm_record(plan, plan_vm, pipeline_context(plan, source.spec.type_, transfer)));
        }
        status.phase = MigrationPhase::Running;
        status.started = Some(now);
        if status.vms.is_empty() {
            status.phase = MigrationPhase::Succeeded;
            status.completed = Some(now);
            return Ok((None, decision));
        }
        info!("{} admitted with {} VMs", object_key(migration), status.vms.len());
        Ok((Some(self.config.poll_interval), decision))
    }

    async fn all_disks_offloaded(&self, source: &Provider, plan_vm: &PlanVm, pairs: &[StoragePair]) -> Result<bool, ControllerError> {
        let uid = source.uid().unwrap_or_default();
        let provider_type = source.spec.type_;
        let found = self
            .call("find source VM", find_source_vm(self.inventory.as_ref(), provider_type, &uid, &plan_vm.source))
            .await?;
        let Some(vm) = found else {
            return Ok(false);
        };
        let ctx = SourceContext { inventory: self.inventory.as_ref(), provider_type, provider_uid: &uid };
        let disks = self.call("list VM disks", source_family(provider_type).disks(&ctx, &vm)).await?;
        Ok(!disks.is_empty() && disks.iter().all(|d| disk_destination(d, pairs).is_some_and(|dest| dest.is_offload())))
    }

    async fn execute_migration(
        &self,
        migration: &Migration,
        plan: &Plan,
        status: &mut MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, ControllerError> {
        let plan_namespace = plan.namespace().unwrap_or_default();
        let mut plan = plan.clone();
        plan.spec.target_namespace = target_namespace(&plan);

        let source = self
            .lookup::<Provider>(&plan.spec.provider.source, &plan_namespace)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("provider {}", plan.spec.provider.source.name)))?;
        let destination = self
            .lookup::<Provider>(&plan.spec.provider.destination, &plan_namespace)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("provider {}", plan.spec.provider.destination.name)))?;
        let adapter = self.adapters.adapter(&source).await?;
        let cluster = self.target_cluster(&destination).await?;
        let secret = self.provider_secret(&source).await?.unwrap_or_default();
        let (network_pairs, storage_pairs) = self.plan_pairs(&plan).await?;
        let hooks = self.plan_hooks(&plan).await?;
        let migration_uid = migration.uid().unwrap_or_default();

        let run = Run {
            config: &self.config,
            plan: &plan,
            migration_uid: &migration_uid,
            source: &source,
            adapter: adapter.as_ref(),
            cluster: cluster.as_ref(),
            inventory: self.inventory.as_ref(),
            network_pairs: &network_pairs,
            storage_pairs: &storage_pairs,
            secret: &secret,
            hooks: &hooks,
            cutover: migration.spec.cutover.or(pending_default_cutover(migration.spec.cutover, status)),
            now,
        };

        if migration.spec.cancel && status.phase == MigrationPhase::Running {
            info!("Canceling {}", object_key(migration));
            status.phase = MigrationPhase::Canceling;
            status.cancel_requested = Some(now);
        }
        if status.phase == MigrationPhase::Canceling {
            if !run.cancel_migration(status).await? {
                return Ok(Some(self.config.poll_interval));
            }
            run.release().await?;
            return Ok(None);
        }

        run.execute(status, &migration.spec.cancel_vms).await?;
        let transferred = status.vms.iter().map(|vm| crate::pipeline::transferred_mib(&vm.pipeline)).sum();
        self.metrics.set_data_transferred(&plan_namespace, &plan.name_any(), transferred);

        if let Some(phase) = migration_outcome(&status.vms) {
            status.phase = phase;
            status.completed = Some(now);
            run.release().await?;
            return Ok(None);
        }
        Ok(Some(self.config.poll_interval))
    }

    /// Pairs of the maps the plan resolved
    async fn plan_pairs(&self, plan: &Plan) -> Result<(Vec<NetworkPair>, Vec<StoragePair>), ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        let status = plan.status.clone().unwrap_or_default();
        let network = match &status.network_map {
            Some(reference) => self.lookup::<NetworkMap>(reference, &namespace).await?.map(|m| m.spec.map),
            None => None,
        };
        let storage = match &status.storage_map {
            Some(reference) => self.lookup::<StorageMap>(reference, &namespace).await?.map(|m| m.spec.map),
            None => None,
        };
        Ok((network.unwrap_or_default(), storage.unwrap_or_default()))
    }

    async fn plan_hooks(&self, plan: &Plan) -> Result<BTreeMap<String, Hook>, ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        let mut hooks = BTreeMap::new();
        for reference in plan.spec.vms.iter().flat_map(|vm| vm.hooks.iter()).map(|h| &h.hook) {
            let key = format!("{}/{}", reference.namespace_or(&namespace), reference.name);
            if hooks.contains_key(&key) {
                continue;
            }
            if let Some(hook) = self.lookup::<Hook>(reference, &namespace).await? {
                hooks.insert(key, hook);
            }
        }
        Ok(hooks)
    }

    async fn record_completion(&self, migration: &Migration, plan: Option<&Plan>, status: &MigrationStatus) -> Result<(), ControllerError> {
        let Some(plan) = plan else {
            return Ok(());
        };
        let namespace = plan.namespace().unwrap_or_default();
        let source = self.lookup::<Provider>(&plan.spec.provider.source, &namespace).await?;
        let destination = self.lookup::<Provider>(&plan.spec.provider.destination, &namespace).await?;
        let (Some(source), Some(destination)) = (source, destination) else {
            return Ok(());
        };
        let labels = MigrationLabels::new(&source, &destination, plan.spec.migration_type());
        let duration = match (status.started, status.completed) {
            (Some(started), Some(completed)) => (completed - started).to_std().ok(),
            _ => None,
        };
        let uid = migration.uid().unwrap_or_default();
        self.metrics.record_migration_completion(&uid, status.phase.as_str(), &labels, duration);
        Ok(())
    }
}
