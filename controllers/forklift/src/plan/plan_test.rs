//! Unit tests for plan validation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::mapping::{SourceNetwork, SourceStorage};
    use crds::{
        find_condition, Category, HookRef, HookStep, NetworkDestination, PlanSpec, ProviderPair, ProviderSpec,
        ProviderStatus, StorageDestination,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn provider(name: &str, type_: ProviderType, ready: bool) -> Provider {
        let mut provider = Provider::new(name, ProviderSpec {
            type_,
            url: if type_ == ProviderType::OpenShift { String::new() } else { "https://src.example.com".into() },
            secret: None,
            settings: Default::default(),
        });
        provider.metadata.namespace = Some("apps".into());
        provider.metadata.uid = Some(format!("{}-uid", name));
        if ready {
            provider.status = Some(ProviderStatus {
                conditions: vec![Condition::ready("The provider is ready.")],
                ..Default::default()
            });
        }
        provider
    }

    fn vm(id: &str, name: &str) -> PlanVm {
        PlanVm {
            source: SourceRef { id: id.into(), name: name.into() },
            ..Default::default()
        }
    }

    fn plan(vms: Vec<PlanVm>) -> Plan {
        Plan {
            metadata: ObjectMeta {
                name: Some("move-web".into()),
                namespace: Some("apps".into()),
                uid: Some("plan-uid".into()),
                generation: Some(3),
                ..Default::default()
            },
            spec: PlanSpec {
                provider: ProviderPair {
                    source: ResourceRef::new("vsphere"),
                    destination: ResourceRef::new("host"),
                },
                target_namespace: "target".into(),
                vms,
                ..Default::default()
            },
            status: None,
        }
    }

    fn nic(network: &str) -> SourceNic {
        SourceNic {
            mac: "00:50:56:00:00:01".into(),
            network: SourceNetwork { source: SourceRef::by_id(network), name: network.into(), pod: false },
        }
    }

    fn disk(storage: &str) -> SourceDisk {
        SourceDisk {
            id: format!("{}-disk", storage),
            storage: SourceStorage { source: SourceRef::by_id(storage), name: storage.into() },
            capacity: 1 << 30,
            file: String::new(),
            shared: false,
        }
    }

    fn resolved<P>(pairs: Vec<P>) -> ResolvedMap<P> {
        ResolvedMap {
            reference: Some(ResourceRef::with_namespace("move-web-x", "apps")),
            pairs,
            origin: MapOrigin::Synthesized,
            ready: true,
        }
    }

    fn ready_inputs() -> PlanInputs {
        PlanInputs {
            source: Some(provider("vsphere", ProviderType::VSphere, true)),
            destination: Some(provider("host", ProviderType::OpenShift, true)),
            network: Some(resolved(vec![NetworkPair {
                source: SourceRef::by_id("net-1"),
                destination: NetworkDestination::pod(),
            }])),
            storage: Some(resolved(vec![StoragePair {
                source: SourceRef::by_id("ds-1"),
                destination: StorageDestination { storage_class: "standard".into(), ..Default::default() },
            }])),
            vms: Vec::new(),
            target_namespace_exists: Some(true),
            hook_problems: Vec::new(),
        }
    }

    fn types_of(conditions: &[Condition]) -> Vec<&str> {
        conditions.iter().map(|c| c.type_.as_str()).collect()
    }

    #[test]
    fn test_empty_plan_with_ready_providers_is_ready() {
        let conditions = validate(&plan(Vec::new()), &ready_inputs());
        assert_eq!(types_of(&conditions), vec![types::READY]);
        assert_eq!(conditions[0].category, Category::Required);
    }

    #[test]
    fn test_missing_and_unready_providers_block() {
        let inputs = PlanInputs {
            source: None,
            destination: Some(provider("host", ProviderType::OpenShift, false)),
            ..PlanInputs::default()
        };
        let conditions = validate(&plan(Vec::new()), &inputs);
        let source = find_condition(&conditions, conditions::SOURCE_PROVIDER_NOT_FOUND).unwrap();
        assert!(source.is_blocker());
        assert!(source.message.contains("vsphere"));
        assert!(find_condition(&conditions, conditions::DESTINATION_PROVIDER_NOT_READY).is_some());
        assert!(find_condition(&conditions, types::READY).is_none());
    }

    #[test]
    fn test_archived_plan_only_reports_archived() {
        let mut archived = plan(vec![vm("vm-1", "web")]);
        archived.spec.archived = true;
        let conditions = validate(&archived, &PlanInputs::default());
        assert_eq!(types_of(&conditions), vec![types::ARCHIVED]);
        assert!(!has_blocker(&conditions));
    }

    #[test]
    fn test_conversion_plan_rejects_storage_map() {
        let mut conversion = plan(Vec::new());
        conversion.spec.type_ = Some(MigrationType::Conversion);
        conversion.spec.map.storage = Some(ResourceRef::new("ds-map"));
        let mut inputs = ready_inputs();
        inputs.storage = None;
        let conditions = validate(&conversion, &inputs);
        assert!(find_condition(&conditions, conditions::CONVERSION_WITH_STORAGE_MAP).is_some());
        assert!(find_condition(&conditions, conditions::STORAGE_MAP_NOT_READY).is_none());
        assert!(has_blocker(&conditions));
    }

    #[test]
    fn test_mode_support_and_warm_flag() {
        let mut warm = plan(Vec::new());
        warm.spec.type_ = Some(MigrationType::Live);
        warm.spec.warm = true;
        let conditions = validate(&warm, &ready_inputs());
        assert!(find_condition(&conditions, conditions::WARM_FLAG_CONFLICT).is_some());
        assert!(find_condition(&conditions, conditions::LIVE_NOT_SUPPORTED).is_some());

        let mut ec2 = plan(Vec::new());
        ec2.spec.type_ = Some(MigrationType::Warm);
        let mut inputs = ready_inputs();
        inputs.source = Some(provider("ec2", ProviderType::Ec2, true));
        let conditions = validate(&ec2, &inputs);
        assert!(find_condition(&conditions, conditions::WARM_NOT_SUPPORTED).unwrap().message.contains("ec2"));
    }

    #[test]
    fn test_duplicate_vms() {
        let vms = vec![vm("vm-1", "web"), vm("vm-2", "db"), vm("vm-1", ""), vm("", "db")];
        assert_eq!(duplicate_vms(&vms), vec!["vm-1".to_string(), "db".to_string()]);

        let conditions = validate(&plan(vms), &ready_inputs());
        let duplicate = find_condition(&conditions, conditions::DUPLICATE_VM).unwrap();
        assert!(duplicate.message.contains("vm-1"));
    }

    #[test]
    fn test_unmapped_networks_and_storage() {
        let mut inputs = ready_inputs();
        inputs.vms = vec![
            Some(VmInventory { nics: vec![nic("net-1"), nic("net-9")], disks: vec![disk("ds-1")] }),
            Some(VmInventory { nics: vec![nic("net-1")], disks: vec![disk("ds-7")] }),
            None,
        ];
        let plan = plan(vec![vm("vm-1", "web"), vm("vm-2", "db"), vm("vm-3", "cache")]);
        let conditions = validate(&plan, &inputs);

        let networks = find_condition(&conditions, conditions::VM_NETWORKS_NOT_MAPPED).unwrap();
        assert_eq!(networks.message, "VM networks without a mapping: web (net-9).");
        let storage = find_condition(&conditions, conditions::VM_STORAGE_NOT_MAPPED).unwrap();
        assert_eq!(storage.message, "VM storage without a mapping: db (ds-7).");
        let missing = find_condition(&conditions, conditions::VM_NOT_FOUND).unwrap();
        assert!(missing.message.contains("cache"));
    }

    #[test]
    fn test_map_not_found_and_not_ready() {
        let mut inputs = ready_inputs();
        inputs.network = Some(ResolvedMap { reference: None, pairs: Vec::new(), origin: MapOrigin::Explicit, ready: false });
        inputs.storage = Some(ResolvedMap {
            reference: Some(ResourceRef::new("ds-map")),
            pairs: Vec::new(),
            origin: MapOrigin::Explicit,
            ready: false,
        });
        let conditions = validate(&plan(Vec::new()), &inputs);
        assert_eq!(find_condition(&conditions, conditions::NETWORK_MAP_NOT_READY).unwrap().reason, "NotFound");
        assert_eq!(find_condition(&conditions, conditions::STORAGE_MAP_NOT_READY).unwrap().reason, "NotReady");
    }

    #[test]
    fn test_target_namespace_and_hooks() {
        let mut bad = plan(Vec::new());
        bad.spec.target_namespace = "Not_Valid".into();
        let conditions = validate(&bad, &ready_inputs());
        assert_eq!(find_condition(&conditions, conditions::TARGET_NAMESPACE_NOT_VALID).unwrap().reason, "NotValid");

        let mut inputs = ready_inputs();
        inputs.target_namespace_exists = Some(false);
        inputs.hook_problems = vec!["hook 'drain' not found".into()];
        let conditions = validate(&plan(Vec::new()), &inputs);
        assert_eq!(find_condition(&conditions, conditions::TARGET_NAMESPACE_NOT_VALID).unwrap().reason, "NotFound");
        assert_eq!(find_condition(&conditions, conditions::HOOK_NOT_VALID).unwrap().message, "hook 'drain' not found.");
    }

    #[test]
    fn test_target_namespace_defaults_to_plan_namespace() {
        let mut p = plan(Vec::new());
        p.spec.target_namespace.clear();
        assert_eq!(target_namespace(&p), "apps");
    }

    #[test]
    fn test_invalid_pvc_template_blocks() {
        let mut p = plan(vec![vm("vm-1", "web")]);
        p.spec.vms[0].pvc_name_template = Some("{{.Unknown".into());
        p.spec.vms[0].hooks = vec![HookRef { step: HookStep::PreHook, hook: ResourceRef::new("drain") }];
        let conditions = validate(&p, &ready_inputs());
        let template = find_condition(&conditions, conditions::PVC_NAME_TEMPLATE_NOT_VALID).unwrap();
        assert!(template.message.contains("VM web"));
    }

    #[test]
    fn test_plan_status_is_idempotent_and_keeps_migration_conditions() {
        let mut p = plan(Vec::new());
        let mut current = PlanStatus::default();
        current.conditions.push(Condition::advisory(types::SUCCEEDED, "Completed", "Migration succeeded."));
        current.conditions.push(Condition::critical(conditions::VM_NOT_FOUND, "NotFound", "gone"));
        p.status = Some(current);

        let inputs = ready_inputs();
        let first = plan_status(&p, &inputs, validate(&p, &inputs));
        assert_eq!(types_of(&first.conditions), vec![types::READY, types::SUCCEEDED]);
        assert_eq!(first.observed_generation, Some(3));
        assert_eq!(first.network_map.as_ref().map(|r| r.name.as_str()), Some("move-web-x"));

        p.status = Some(first.clone());
        let second = plan_status(&p, &inputs, validate(&p, &inputs));
        assert_eq!(first, second);
    }

    #[test]
    fn test_nic_and_disk_destinations() {
        let pairs = vec![NetworkPair {
            source: SourceRef::by_name("net-1"),
            destination: NetworkDestination::multus(None, "prod"),
        }];
        let destinations = nic_destinations(&[nic("net-1"), nic("net-2")], &pairs);
        assert_eq!(destinations[0], NetworkDestination::multus(None, "prod"));
        assert_eq!(destinations[1], NetworkDestination::ignored());

        let storage = ready_inputs().storage.unwrap().pairs;
        assert_eq!(disk_destination(&disk("ds-1"), &storage).map(|d| d.storage_class.as_str()), Some("standard"));
        assert!(disk_destination(&disk("ds-2"), &storage).is_none());
    }
}
