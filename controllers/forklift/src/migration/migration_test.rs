#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::adapter::SecretData;
    use crate::builder::fixtures;
    use crate::events::{CUTOVER_DEFAULTED, CUTOVER_IN_PAST};
    use crate::test_utils::{create_test_provider, MockAdapter, MockCluster, RecordingEvents};
    use chrono::TimeZone;
    use crds::{
        find_condition, HookRef, HookStep, MigrationSpec, MigrationType, PlanStatus, PopulatorKind, PowerState,
        ProviderType, SourceRef, StepName, StepPhase, StorageDestination, TransferMethod,
    };
    use inventory_client::{HyperVVm, MockInventoryClient, Ref, VSphereDisk, VSphereVm};
    use k8s_openapi::api::core::v1::ObjectReference;
    use kube::api::DynamicObject;
    use serde_json::json;

    const MIGRATION_UID: &str = "mig-0001";
    const GIB: u64 = 1 << 30;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
    }

    fn plan_vm(id: &str, name: &str) -> PlanVm {
        PlanVm { source: SourceRef { id: id.into(), name: name.into() }, ..Default::default() }
    }

    fn ready_plan(vms: Vec<PlanVm>) -> Plan {
        let mut plan = fixtures::plan();
        plan.spec.vms = vms;
        plan.status = Some(PlanStatus { conditions: vec![Condition::ready("The plan is ready.")], ..Default::default() });
        plan
    }

    fn vsphere_vm(id: &str, name: &str, disks: i32) -> SourceVm {
        SourceVm::VSphere(VSphereVm {
            id: id.into(),
            name: name.into(),
            uuid: format!("4211-{}", id),
            cpu_count: 2,
            memory_mb: 4096,
            disks: (0..disks)
                .map(|i| VSphereDisk {
                    key: 2000 + i,
                    file: format!("[ds1] {}/{}_{}.vmdk", name, name, i),
                    datastore: Ref { id: "ds-1".into() },
                    capacity: 10 * GIB,
                    shared: false,
                })
                .collect(),
            ..Default::default()
        })
    }

    fn labeled(kind: &str, name: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": { "name": name, "namespace": "target", "labels": labels },
        }))
        .unwrap()
    }

    /// In-memory world one migration runs against
    struct Fixture {
        config: Config,
        plan: Plan,
        source: Provider,
        adapter: MockAdapter,
        cluster: MockCluster,
        inventory: MockInventoryClient,
        storage_pairs: Vec<StoragePair>,
        secret: SecretData,
        hooks: BTreeMap<String, Hook>,
        cutover: Option<DateTime<Utc>>,
    }

    impl Fixture {
        fn new(provider: ProviderType, adapter: MockAdapter, vms: Vec<PlanVm>) -> Self {
            Self {
                config: Config::default(),
                plan: ready_plan(vms),
                source: create_test_provider("source", provider, true),
                adapter,
                cluster: MockCluster::new(),
                inventory: MockInventoryClient::new("http://inventory.test"),
                storage_pairs: vec![StoragePair {
                    source: SourceRef::by_id("ds-1"),
                    destination: StorageDestination { storage_class: "standard".into(), ..Default::default() },
                }],
                secret: SecretData::default(),
                hooks: BTreeMap::new(),
                cutover: None,
            }
        }

        fn add_vm(&self, vm: SourceVm) {
            self.inventory.add_vm("source-uid", vm);
        }

        fn run(&self, now: DateTime<Utc>) -> Run<'_> {
            Run {
                config: &self.config,
                plan: &self.plan,
                migration_uid: MIGRATION_UID,
                source: &self.source,
                adapter: &self.adapter,
                cluster: &self.cluster,
                inventory: &self.inventory,
                network_pairs: &[],
                storage_pairs: &self.storage_pairs,
                secret: &self.secret,
                hooks: &self.hooks,
                cutover: self.cutover,
                now,
            }
        }

        /// Running migration status with one record per plan VM
        fn status(&self) -> MigrationStatus {
            let provider = self.source.spec.type_;
            let transfer = transfer_method(provider, self.plan.spec.migration_type(), false);
            MigrationStatus {
                phase: MigrationPhase::Running,
                vms: self
                    .plan
                    .spec
                    .vms
                    .iter()
                    .map(|v| vm_record(&self.plan, v, pipeline_context(&self.plan, provider, transfer)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    fn migration(name: &str, uid: &str, phase: MigrationPhase) -> Migration {
        let mut migration = Migration::new(
            name,
            MigrationSpec { plan: ResourceRef::new("move-web"), ..Default::default() },
        );
        migration.metadata.namespace = Some("apps".into());
        migration.metadata.uid = Some(uid.into());
        migration.status = Some(MigrationStatus { phase, ..Default::default() });
        migration
    }

    fn step_phase(vm: &VmStatus, name: StepName) -> Option<StepPhase> {
        vm.step(name).map(|s| s.phase)
    }

    #[test]
    fn test_admission_waits_for_ready_plan() {
        let migration = migration("m1", "u1", MigrationPhase::Pending);
        let mut plan = fixtures::plan();
        match admit(&migration, Some(&plan), &[]) {
            Admission::Wait(condition) => assert_eq!(condition.type_, admission::conditions::PLAN_NOT_READY),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(admit(&migration, None, &[]), Admission::Wait(_)));

        plan.status = Some(PlanStatus {
            conditions: vec![Condition::ready("ok"), Condition::advisory(types::SUCCEEDED, "Succeeded", "done")],
            ..Default::default()
        });
        match admit(&migration, Some(&plan), &[]) {
            Admission::Reject(condition) => assert_eq!(condition.type_, admission::conditions::PLAN_ALREADY_SUCCEEDED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_admission_one_running_migration_per_plan() {
        let plan = ready_plan(vec![]);
        let pending = migration("b-second", "u2", MigrationPhase::Pending);
        let running = migration("a-first", "u1", MigrationPhase::Running);
        match admit(&pending, Some(&plan), &[running.clone(), pending.clone()]) {
            Admission::Wait(condition) => {
                assert_eq!(condition.type_, types::BLOCKED);
                assert!(condition.message.contains("a-first"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // older pending migrations go first, unless they were canceled
        let mut older = migration("a-first", "u1", MigrationPhase::Pending);
        assert!(matches!(admit(&pending, Some(&plan), &[older.clone()]), Admission::Wait(_)));
        older.spec.cancel = true;
        assert_eq!(admit(&pending, Some(&plan), &[older]), Admission::Admit);

        // a finished sibling or one on another plan does not block
        let done = migration("a-first", "u1", MigrationPhase::Succeeded);
        let mut other_plan = migration("a-other", "u3", MigrationPhase::Running);
        other_plan.spec.plan = ResourceRef::new("move-db");
        assert_eq!(admit(&pending, Some(&plan), &[done, other_plan]), Admission::Admit);
    }

    #[tokio::test]
    async fn test_cutover_default_announced_once() {
        let now = at(10, 0);
        let events = RecordingEvents::default();
        let regarding = ObjectReference { name: Some("m1".into()), ..Default::default() };

        let decision = cutover_decision(MigrationType::Warm, None, now);
        assert_eq!(decision, CutoverDecision::Default(at(11, 0)));
        admission::announce_cutover(&events, &regarding, decision, false).await;
        admission::announce_cutover(&events, &regarding, decision, true).await;

        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].type_, "Warning");
        assert_eq!(recorded[0].reason, CUTOVER_DEFAULTED);
        assert_eq!(recorded[0].regarding, "m1");
    }

    #[tokio::test]
    async fn test_default_cutover_persisted_after_status() {
        let now = at(10, 0);
        // What admission leaves in the status of a warm migration without a cutover
        let admitted = MigrationStatus {
            phase: MigrationPhase::Running,
            started: Some(now),
            cutover_defaulted: true,
            ..Default::default()
        };

        // The flag and start time reach the written status patch, read back on the next pass
        let patch = crate::reconcile_helpers::status_patch(&admitted, Some("41")).unwrap();
        assert_eq!(patch["status"]["cutoverDefaulted"], json!(true));
        let stored: MigrationStatus = serde_json::from_value(patch["status"].clone()).unwrap();
        assert!(stored.cutover_defaulted);

        // The spec write follows the status write and is retried until the spec carries it
        assert_eq!(admission::pending_default_cutover(None, &stored), Some(at(11, 0)));
        assert_eq!(admission::pending_default_cutover(Some(at(11, 0)), &stored), None);
        assert_eq!(admission::pending_default_cutover(None, &MigrationStatus::default()), None);
        let finished = MigrationStatus { phase: MigrationPhase::Succeeded, ..stored.clone() };
        assert_eq!(admission::pending_default_cutover(None, &finished), None);

        // No second warning once the stored status says it was announced
        let events = RecordingEvents::default();
        let regarding = ObjectReference { name: Some("m1".into()), ..Default::default() };
        let decision = cutover_decision(MigrationType::Warm, None, now);
        admission::announce_cutover(&events, &regarding, decision, stored.cutover_defaulted).await;
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn test_cutover_in_past_and_cold() {
        let now = at(10, 0);
        let events = RecordingEvents::default();
        let regarding = ObjectReference { name: Some("m1".into()), ..Default::default() };

        let decision = cutover_decision(MigrationType::Warm, Some(at(9, 0)), now);
        assert_eq!(decision, CutoverDecision::Past);
        admission::announce_cutover(&events, &regarding, decision, false).await;
        assert_eq!(events.events()[0].reason, CUTOVER_IN_PAST);

        assert_eq!(cutover_decision(MigrationType::Warm, Some(at(12, 0)), now), CutoverDecision::Keep);
        assert_eq!(cutover_decision(MigrationType::Cold, None, now), CutoverDecision::Keep);
    }

    #[test]
    fn test_progress_units_saturate() {
        assert_eq!(steps::to_mib(5 * (1 << 20) + 1), 5);
        assert_eq!(steps::to_mib(u64::MAX), (u64::MAX >> 20) as i64);

        assert_eq!(steps::percent_of(1024, 50.0), 512);
        assert_eq!(steps::percent_of(1024, 150.0), 1024);
        assert_eq!(steps::percent_of(1024, -3.0), 0);
        assert_eq!(steps::percent_of(1024, f64::NAN), 0);
        assert!(steps::percent_of(i64::MAX, 99.9999) < i64::MAX);
    }

    #[test]
    fn test_migration_outcome() {
        let done = |outcome| VmStatus { outcome: Some(outcome), ..Default::default() };
        assert_eq!(migration_outcome(&[]), Some(MigrationPhase::Succeeded));
        assert_eq!(migration_outcome(&[done(VmOutcome::Succeeded), VmStatus::default()]), None);
        assert_eq!(
            migration_outcome(&[done(VmOutcome::Succeeded), done(VmOutcome::Failed), done(VmOutcome::Canceled)]),
            Some(MigrationPhase::Failed)
        );
        assert_eq!(
            migration_outcome(&[done(VmOutcome::Canceled), done(VmOutcome::Canceled)]),
            Some(MigrationPhase::Canceled)
        );
        assert_eq!(
            migration_outcome(&[done(VmOutcome::Succeeded), done(VmOutcome::Canceled)]),
            Some(MigrationPhase::Succeeded)
        );
    }

    #[test]
    fn test_plan_outcome_status_history_per_uid() {
        let mut plan = ready_plan(vec![]);
        let migration = migration("m1", "u1", MigrationPhase::Running);
        let mut status = MigrationStatus { phase: MigrationPhase::Running, started: Some(at(10, 0)), ..Default::default() };

        let running = plan_outcome_status(&plan, &migration, &status, at(10, 0));
        let executing = find_condition(&running.conditions, types::EXECUTING).unwrap();
        assert_eq!(executing.message, "Migration 'm1' is running.");
        assert!(running.migration.history.is_empty());
        assert!(crds::is_condition_true(&running.conditions, types::READY));

        plan.status = Some(running);
        status.phase = MigrationPhase::Succeeded;
        status.completed = Some(at(11, 0));
        let finished = plan_outcome_status(&plan, &migration, &status, at(11, 0));
        assert!(find_condition(&finished.conditions, types::EXECUTING).is_none());
        assert_eq!(find_condition(&finished.conditions, types::SUCCEEDED).unwrap().reason, "Succeeded");
        assert_eq!(finished.migration.history.len(), 1);
        assert_eq!(finished.migration.history[0].uid, "u1");
        assert_eq!(finished.migration.history[0].result, "Succeeded");

        plan.status = Some(finished);
        let again = plan_outcome_status(&plan, &migration, &status, at(11, 5));
        assert_eq!(again.migration.history.len(), 1);
    }

    #[tokio::test]
    async fn test_cold_vsphere_virt_v2v_run() {
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::On), vec![plan_vm("vm-1", "web-01")]);
        fx.add_vm(vsphere_vm("vm-1", "web-01", 2));
        let mut status = fx.status();
        assert_eq!(status.vms[0].transfer_method, TransferMethod::V2v);

        // power off requested, the VM is still on
        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.phase, Some(StepName::PowerOff));
        assert_eq!(vm.restore_power_state, Some(PowerState::On));
        assert_eq!(fx.adapter.calls(), vec!["power_off vm-1".to_string()]);

        // off: claims are created and virt-v2v starts
        fx.run(at(10, 1)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(status.vms[0].phase, Some(StepName::DiskTransferV2v));
        let claims = fx.cluster.names(ScratchKind::Pvc);
        assert_eq!(claims.len(), 2);
        assert!(claims.iter().all(|c| c.starts_with("web-01-disk-")));
        let pods = fx.cluster.names(ScratchKind::Pod);
        assert_eq!(pods.len(), 1);
        let transfer = status.vms[0].step(StepName::DiskTransferV2v).unwrap();
        assert_eq!(transfer.tasks.len(), 2);
        assert_eq!(transfer.progress.total, 20480);

        // a second pass while the pod runs changes nothing
        fx.run(at(10, 2)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(fx.cluster.names(ScratchKind::Pvc).len(), 2);
        assert_eq!(status.vms[0].outcome, None);

        fx.cluster.set_status(ScratchKind::Pod, "target", &pods[0], json!({ "phase": "Succeeded" }));
        fx.run(at(10, 30)).execute(&mut status, &[]).await.unwrap();

        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Succeeded));
        assert_eq!(vm.completed, Some(at(10, 30)));
        assert!(vm.pipeline.iter().all(|s| s.phase == StepPhase::Succeeded));
        assert_eq!(vm.step(StepName::DiskTransferV2v).unwrap().progress.completed, 20480);
        assert_eq!(fx.cluster.names(ScratchKind::VirtualMachine), vec!["web-01".to_string()]);
        assert_eq!(fx.cluster.deleted(ScratchKind::Pod), pods);
        assert_eq!(fx.cluster.names(ScratchKind::Pvc).len(), 2);
        assert_eq!(migration_outcome(&status.vms), Some(MigrationPhase::Succeeded));
    }

    #[tokio::test]
    async fn test_power_off_skipped_when_already_off() {
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::Off), vec![plan_vm("vm-1", "web-01")]);
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let power_off = status.vms[0].step(StepName::PowerOff).unwrap();
        assert_eq!(power_off.phase, StepPhase::Skipped);
        assert_eq!(power_off.reason.as_deref(), Some("AlreadyOff"));
        assert!(fx.adapter.calls().is_empty());
        assert_eq!(status.vms[0].phase, Some(StepName::DiskTransferV2v));
    }

    #[tokio::test]
    async fn test_vm_missing_from_inventory_fails() {
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::On), vec![plan_vm("vm-1", "web-01")]);
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Failed));
        assert_eq!(vm.error.as_ref().unwrap().phase, "Initialize");
        assert_eq!(step_phase(vm, StepName::Initialize), Some(StepPhase::Failed));
        assert_eq!(step_phase(vm, StepName::PowerOff), Some(StepPhase::Pending));
    }

    #[tokio::test]
    async fn test_read_only_source_fails_at_power_off_and_cleans_up() {
        let mut fx = Fixture::new(ProviderType::HyperV, MockAdapter::read_only(PowerState::On), vec![plan_vm("vm-1", "db")]);
        fx.plan.spec.delete_vm_on_fail_migration = true;
        fx.add_vm(SourceVm::HyperV(HyperVVm { id: "vm-1".into(), name: "db".into(), ..Default::default() }));
        fx.cluster.insert(
            ScratchKind::Pvc,
            labeled("PersistentVolumeClaim", "db-disk-0-00001", json!({ "migration": MIGRATION_UID, "vmID": "vm-1" })),
        );
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Failed));
        assert_eq!(vm.error.as_ref().unwrap().phase, "PowerOff");
        let step = vm.step(StepName::PowerOff).unwrap();
        assert_eq!(step.phase, StepPhase::Failed);
        assert!(step.error.as_deref().unwrap().contains("vm-1"));
        assert_eq!(fx.cluster.deleted(ScratchKind::Pvc), vec!["db-disk-0-00001".to_string()]);
        // the source is left as it was
        assert_eq!(fx.adapter.calls(), vec!["power_off vm-1".to_string()]);
    }

    #[tokio::test]
    async fn test_transfer_slots_limit_concurrent_vms() {
        let mut fx = Fixture::new(
            ProviderType::VSphere,
            MockAdapter::new(PowerState::Off),
            vec![plan_vm("vm-1", "web-01"), plan_vm("vm-2", "web-02")],
        );
        fx.config.max_vm_inflight = 1;
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        fx.add_vm(vsphere_vm("vm-2", "web-02", 1));
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        fx.run(at(10, 1)).execute(&mut status, &[]).await.unwrap();

        assert_eq!(fx.cluster.names(ScratchKind::Pod).len(), 1);
        assert_eq!(step_phase(&status.vms[0], StepName::DiskTransferV2v), Some(StepPhase::Running));
        assert_eq!(step_phase(&status.vms[1], StepName::DiskTransferV2v), Some(StepPhase::Pending));
        assert_eq!(status.vms[1].phase, Some(StepName::DiskTransferV2v));
        // both have their claims
        assert_eq!(fx.cluster.names(ScratchKind::Pvc).len(), 2);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_vm() {
        let mut fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::On), vec![plan_vm("vm-1", "web-01")]);
        fx.config.create_phase_timeout = std::time::Duration::from_secs(60);
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        let mut status = fx.status();
        {
            let vm = &mut status.vms[0];
            vm.id = "vm-1".into();
            vm.restore_power_state = Some(PowerState::On);
            crate::pipeline::succeed(vm.step_mut(StepName::Initialize).unwrap(), at(10, 0));
            let power_off = vm.step_mut(StepName::PowerOff).unwrap();
            crate::pipeline::start(power_off, at(10, 0));
            crate::pipeline::begin_task(power_off, steps::POWER_OFF_TASK, at(10, 0));
        }

        fx.run(at(10, 10)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Failed));
        let step = vm.step(StepName::PowerOff).unwrap();
        assert_eq!(step.reason.as_deref(), Some(crate::pipeline::TIMEOUT_REASON));
        assert_eq!(step.error.as_deref(), Some("PowerOff did not finish within 60s."));
        assert!(fx.adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_vm_removed_from_plan_fails() {
        let mut fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::Off), vec![plan_vm("vm-1", "web-01")]);
        let mut status = fx.status();
        fx.plan.spec.vms.clear();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Failed));
        assert_eq!(vm.error.as_ref().unwrap().reasons, vec!["VM was removed from the plan.".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_hook_fails_pre_hook() {
        let mut vm = plan_vm("vm-1", "web-01");
        vm.hooks = vec![HookRef { step: HookStep::PreHook, hook: ResourceRef::new("pre") }];
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::Off), vec![vm]);
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Failed));
        assert_eq!(vm.error.as_ref().unwrap().phase, "PreHook");
        assert_eq!(vm.error.as_ref().unwrap().reasons, vec!["Hook 'apps/pre' not found.".to_string()]);
    }

    #[tokio::test]
    async fn test_warm_precopy_rounds_then_cutover() {
        let mut fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::On), vec![plan_vm("vm-1", "web-01")]);
        fx.plan.spec.type_ = Some(MigrationType::Warm);
        fx.cutover = Some(at(14, 0));
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        let mut status = fx.status();
        assert_eq!(status.vms[0].transfer_method, TransferMethod::DataVolume);

        // first snapshot, DataVolume created with its checkpoint, round open
        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(status.vms[0].phase, Some(StepName::DiskTransfer));
        let dvs = fx.cluster.names(ScratchKind::DataVolume);
        assert_eq!(dvs, vec!["web-01-disk-0-mig-0".to_string()]);
        let dv = &dvs[0];
        let checkpoints = |fx: &Fixture| {
            let obj = fx.cluster.object(ScratchKind::DataVolume, "target", dv).unwrap();
            obj.data["spec"]["checkpoints"].as_array().map(Vec::len).unwrap_or_default()
        };
        assert_eq!(checkpoints(&fx), 1);
        assert_eq!(super::super::warm::checkpoints(&status.vms[0])[0].current, "snap-1-2000");

        // the importer paused: round ends, next one is an interval away
        fx.cluster.set_status(ScratchKind::DataVolume, "target", dv, json!({ "phase": "Paused", "progress": "100.0%" }));
        fx.run(at(10, 1)).execute(&mut status, &[]).await.unwrap();
        let warm = status.vms[0].warm.clone().unwrap();
        assert_eq!(warm.successes, 1);
        assert_eq!(warm.next_precopy_at, Some(at(11, 1)));

        fx.run(at(10, 30)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(fx.adapter.calls().iter().filter(|c| c.starts_with("create_snapshot")).count(), 1);

        // second round: snapshot, then the checkpoint is appended
        fx.run(at(11, 2)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(super::super::warm::awaiting(&status.vms[0]).map(|s| s.id), Some("snap-2".to_string()));
        fx.run(at(11, 3)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(checkpoints(&fx), 2);
        assert_eq!(super::super::warm::awaiting(&status.vms[0]), None);

        // round two ends; the first snapshot is no longer needed
        fx.run(at(11, 4)).execute(&mut status, &[]).await.unwrap();
        assert!(fx.adapter.calls().contains(&"remove_snapshot vm-1 snap-1-2000".to_string()));
        assert_eq!(status.vms[0].snapshots.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["snap-2"]);

        // cutover: power off, final snapshot, final checkpoint
        fx.run(at(14, 0)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(status.vms[0].phase, Some(StepName::Cutover));
        assert!(fx.adapter.calls().contains(&"power_off vm-1".to_string()));
        fx.run(at(14, 1)).execute(&mut status, &[]).await.unwrap();
        fx.run(at(14, 2)).execute(&mut status, &[]).await.unwrap();
        let obj = fx.cluster.object(ScratchKind::DataVolume, "target", dv).unwrap();
        assert_eq!(obj.data["spec"]["finalCheckpoint"], json!(true));
        assert_eq!(obj.data["spec"]["checkpoints"].as_array().unwrap().len(), 3);

        // import done: guest conversion starts in place
        fx.cluster.set_status(ScratchKind::DataVolume, "target", dv, json!({ "phase": "Succeeded", "progress": "100.0%" }));
        fx.run(at(14, 20)).execute(&mut status, &[]).await.unwrap();
        let vm = &status.vms[0];
        assert_eq!(step_phase(vm, StepName::Cutover), Some(StepPhase::Succeeded));
        assert_eq!(vm.phase, Some(StepName::GuestConversion));
        assert!(vm.warm.as_ref().unwrap().precopies.iter().all(|p| p.end.is_some()));
        assert_eq!(fx.cluster.names(ScratchKind::Pod).len(), 1);
    }

    #[tokio::test]
    async fn test_precopy_failures_are_bounded() {
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::On), vec![plan_vm("vm-1", "web-01")]);
        let run = fx.run(at(10, 0));
        let mut vm = VmStatus {
            warm: Some(crds::WarmStatus {
                precopies: vec![crds::Precopy { start: Some(at(9, 0)), end: None, snapshot: "snap-9".into() }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let error = || ControllerError::Validation("snapshot rejected".into());

        assert_eq!(run.precopy_failure(&mut vm, error()), steps::StepOutcome::Wait);
        // the round whose snapshot never became ready is dropped
        assert!(vm.warm.as_ref().unwrap().precopies.is_empty());
        assert_eq!(run.precopy_failure(&mut vm, error()), steps::StepOutcome::Wait);
        assert!(matches!(run.precopy_failure(&mut vm, error()), steps::StepOutcome::Fail(_)));
        assert_eq!(vm.warm.as_ref().unwrap().failures, warm::MAX_PRECOPY_FAILURES);
    }

    fn ovirt_populator_fixture() -> (Fixture, MigrationStatus) {
        let fx = Fixture::new(ProviderType::OVirt, MockAdapter::new(PowerState::Off), vec![plan_vm("vm-1", "db")]);
        let mut status = fx.status();
        assert_eq!(status.vms[0].transfer_method, TransferMethod::Populator);
        let vm = &mut status.vms[0];
        for name in [StepName::Initialize, StepName::PowerOff, StepName::CreateVolumes] {
            crate::pipeline::succeed(vm.step_mut(name).unwrap(), at(9, 0));
        }
        crate::pipeline::start(vm.step_mut(StepName::DiskTransfer).unwrap(), at(9, 0));

        let labels = json!({ "migration": MIGRATION_UID, "vmID": "vm-1", "diskID": "disk-1" });
        let populator = labeled("OvirtVolumePopulator", "db-disk-0", labels.clone());
        fx.cluster.insert(ScratchKind::Populator(PopulatorKind::Ovirt), populator);
        fx.cluster.insert(ScratchKind::Pvc, labeled("PersistentVolumeClaim", "db-disk-0-00001", labels));
        status.phase = MigrationPhase::Canceling;
        status.cancel_requested = Some(at(10, 0));
        (fx, status)
    }

    #[tokio::test]
    async fn test_cancel_deletes_populators_and_keeps_claims() {
        let (fx, mut status) = ovirt_populator_fixture();
        let run = fx.run(at(10, 0));

        assert!(!run.cancel_migration(&mut status).await.unwrap());
        assert_eq!(fx.cluster.deleted(ScratchKind::Populator(PopulatorKind::Ovirt)), vec!["db-disk-0".to_string()]);
        assert_eq!(status.phase, MigrationPhase::Canceling);

        assert!(run.cancel_migration(&mut status).await.unwrap());
        assert_eq!(status.phase, MigrationPhase::Canceled);
        assert_eq!(status.completed, Some(at(10, 0)));
        assert_eq!(fx.cluster.names(ScratchKind::Pvc), vec!["db-disk-0-00001".to_string()]);

        let vm = &status.vms[0];
        assert_eq!(vm.outcome, Some(VmOutcome::Canceled));
        let transfer = vm.step(StepName::DiskTransfer).unwrap();
        assert_eq!(transfer.phase, StepPhase::Skipped);
        assert_eq!(transfer.reason.as_deref(), Some("Canceled"));
        assert_eq!(step_phase(vm, StepName::Initialize), Some(StepPhase::Succeeded));
        assert!(fx.adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_grace_period_completes_immediately() {
        let (fx, mut status) = ovirt_populator_fixture();
        let run = fx.run(at(10, 5));

        assert!(run.cancel_migration(&mut status).await.unwrap());
        assert_eq!(status.phase, MigrationPhase::Canceled);
        assert!(fx.cluster.deleted(ScratchKind::Populator(PopulatorKind::Ovirt)).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_single_vm() {
        let fx = Fixture::new(
            ProviderType::VSphere,
            MockAdapter::new(PowerState::Off),
            vec![plan_vm("vm-1", "web-01"), plan_vm("vm-2", "web-02")],
        );
        fx.add_vm(vsphere_vm("vm-1", "web-01", 1));
        fx.add_vm(vsphere_vm("vm-2", "web-02", 1));
        let mut status = fx.status();

        fx.run(at(10, 0)).execute(&mut status, &[]).await.unwrap();
        assert_eq!(fx.cluster.names(ScratchKind::Pod).len(), 2);

        fx.run(at(10, 1)).execute(&mut status, &[SourceRef::by_name("web-02")]).await.unwrap();
        assert_eq!(status.vms[0].outcome, None);
        assert_eq!(status.vms[1].outcome, Some(VmOutcome::Canceled));
        assert_eq!(fx.cluster.deleted(ScratchKind::Pod).len(), 1);
        assert_eq!(fx.cluster.names(ScratchKind::Pod).len(), 1);
        assert_eq!(migration_outcome(&status.vms), None);
    }

    #[tokio::test]
    async fn test_release_removes_credentials_and_hook_inputs() {
        let fx = Fixture::new(ProviderType::VSphere, MockAdapter::new(PowerState::Off), vec![]);
        let labels = json!({ "migration": MIGRATION_UID });
        fx.cluster.insert(ScratchKind::Secret, labeled("Secret", "web-01-source", labels.clone()));
        fx.cluster.insert(ScratchKind::ConfigMap, labeled("ConfigMap", "web-01-prehook", labels.clone()));
        fx.cluster.insert(ScratchKind::Pvc, labeled("PersistentVolumeClaim", "web-01-disk-0", labels));

        fx.run(at(10, 0)).release().await.unwrap();
        assert!(fx.cluster.names(ScratchKind::Secret).is_empty());
        assert!(fx.cluster.names(ScratchKind::ConfigMap).is_empty());
        assert_eq!(fx.cluster.names(ScratchKind::Pvc).len(), 1);
    }

    #[test]
    fn test_checkpoints_stop_at_unready_snapshot() {
        let vm = VmStatus {
            snapshots: vec![crds::SnapshotRef { id: "s2".into(), disk_id: None }],
            warm: Some(crds::WarmStatus {
                precopies: vec![
                    crds::Precopy { start: Some(at(9, 0)), end: Some(at(9, 5)), snapshot: "s1".into() },
                    crds::Precopy { start: Some(at(10, 0)), end: None, snapshot: "s2".into() },
                    crds::Precopy { start: Some(at(11, 0)), end: None, snapshot: "s3".into() },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let checkpoints = warm::checkpoints(&vm);
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].previous, "");
        assert_eq!(checkpoints[1].previous, "s1");
        assert_eq!(checkpoints[1].current, "s2");
        assert_eq!(warm::awaiting(&vm).map(|s| s.id), Some("s3".to_string()));
    }

    #[test]
    fn test_grace_elapsed() {
        let grace = std::time::Duration::from_secs(120);
        assert!(!grace_elapsed(None, grace, at(10, 0)));
        assert!(!grace_elapsed(Some(at(10, 0)), grace, at(10, 1)));
        assert!(grace_elapsed(Some(at(10, 0)), grace, at(10, 2)));
    }
}
