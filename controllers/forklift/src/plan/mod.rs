//! Plan reconciliation.
//!
//! Each reconcile gathers everything a plan depends on into [`PlanInputs`] (providers, the
//! resolved network and storage pairs, the inventory of every VM, hooks) and hands it to
//! [`validate`], which is pure. Map resolution follows a fixed priority: an explicit map
//! reference, then the inline pair expressions, then pairs synthesized from the inventory.
//! Inline and synthesized pairs are stored as `<plan>-network` / `<plan>-storage` maps owned
//! by the plan.

use crate::error::ControllerError;
use crate::inline::{parse_network_pairs, parse_storage_pairs};
use crate::mapping::{
    covers, network, source_family, source_networks, source_storages, storage, InventoryTargets, SourceContext,
    SourceDisk, SourceNic, TargetNetworkFetcher, TargetStorageFetcher,
};
use crate::metrics::MigrationLabels;
use crate::reconcile_helpers::{object_key, owner_reference};
use crate::reconciler::Reconciler;
use crate::template::{is_dns1123_label, validate_template, TemplateKind};
use chrono::Utc;
use crds::{
    has_blocker, labels, merge_conditions, types, Condition, Hook, MapStatus, MigrationType, NetworkMap, NetworkMapSpec,
    NetworkPair, Plan, PlanStatus, PlanVm, Provider, ProviderType, ResourceRef, SourceRef, StorageMap,
    StorageMapSpec, StoragePair,
};
use inventory_client::{InventoryClientTrait, InventoryError, SourceVm};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "plan_test.rs"]
mod plan_test;

/// Condition types written by the plan controller
pub mod conditions {
    pub const SOURCE_PROVIDER_NOT_FOUND: &str = "SourceProviderNotFound";
    pub const SOURCE_PROVIDER_NOT_READY: &str = "SourceProviderNotReady";
    pub const DESTINATION_PROVIDER_NOT_FOUND: &str = "DestinationProviderNotFound";
    pub const DESTINATION_PROVIDER_NOT_READY: &str = "DestinationProviderNotReady";
    pub const NETWORK_MAP_NOT_READY: &str = "NetworkMapNotReady";
    pub const STORAGE_MAP_NOT_READY: &str = "StorageMapNotReady";
    pub const VM_NOT_FOUND: &str = "VMNotFound";
    pub const VM_NETWORKS_NOT_MAPPED: &str = "VMNetworksNotMapped";
    pub const VM_STORAGE_NOT_MAPPED: &str = "VMStorageNotMapped";
    pub const WARM_FLAG_CONFLICT: &str = "WarmFlagConflict";
    pub const CONVERSION_WITH_STORAGE_MAP: &str = "ConversionWithStorageMap";
    pub const WARM_NOT_SUPPORTED: &str = "WarmNotSupported";
    pub const LIVE_NOT_SUPPORTED: &str = "LiveNotSupported";
    pub const PVC_NAME_TEMPLATE_NOT_VALID: &str = "PVCNameTemplateNotValid";
    pub const VOLUME_NAME_TEMPLATE_NOT_VALID: &str = "VolumeNameTemplateNotValid";
    pub const NETWORK_NAME_TEMPLATE_NOT_VALID: &str = "NetworkNameTemplateNotValid";
    pub const TARGET_NAMESPACE_NOT_VALID: &str = "TargetNamespaceNotValid";
    pub const HOOK_NOT_VALID: &str = "HookNotValid";
    pub const DUPLICATE_VM: &str = "DuplicateVM";
}

/// Conditions owned by the migration controller, never removed here
pub const MIGRATION_CONDITIONS: &[&str] = &[types::EXECUTING, types::SUCCEEDED, types::FAILED, types::CANCELED];

/// Where a plan's pairs came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOrigin {
    /// `spec.map.network` / `spec.map.storage`
    Explicit,
    /// `spec.networkPairs` / `spec.storagePairs`
    Inline,
    /// Built from the inventory
    Synthesized,
}

/// Pairs a plan resolved for one map kind
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMap<P> {
    /// Map object holding the pairs, `None` when an explicit reference does not resolve
    pub reference: Option<ResourceRef>,
    /// Ordered pairs
    pub pairs: Vec<P>,
    /// Origin of the pairs
    pub origin: MapOrigin,
    /// The map object is Ready (always true for inline and synthesized pairs)
    pub ready: bool,
}

/// Inventory of one plan VM
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmInventory {
    /// NICs in device order
    pub nics: Vec<SourceNic>,
    /// Disks in device order
    pub disks: Vec<SourceDisk>,
}

/// Everything a plan depends on, gathered before validation
#[derive(Debug, Clone, Default)]
pub struct PlanInputs {
    /// Source provider, if it exists
    pub source: Option<Provider>,
    /// Destination provider, if it exists
    pub destination: Option<Provider>,
    /// Resolved network pairs (`None` until the providers are usable)
    pub network: Option<ResolvedMap<NetworkPair>>,
    /// Resolved storage pairs (`None` for conversion plans or until the providers are usable)
    pub storage: Option<ResolvedMap<StoragePair>>,
    /// Inventory of `spec.vms`, index for index; empty when the inventory was not consulted
    pub vms: Vec<Option<VmInventory>>,
    /// Target namespace exists; `None` when it cannot be checked (remote destination)
    pub target_namespace_exists: Option<bool>,
    /// Problems with referenced hooks, one message each
    pub hook_problems: Vec<String>,
}

/// Effective target namespace of a plan
pub fn target_namespace(plan: &Plan) -> String {
    if plan.spec.target_namespace.is_empty() {
        plan.namespace().unwrap_or_default()
    } else {
        plan.spec.target_namespace.clone()
    }
}

fn provider_conditions(out: &mut Vec<Condition>, provider: Option<&Provider>, reference: &ResourceRef, source: bool) {
    let (not_found, not_ready, role) = if source {
        (conditions::SOURCE_PROVIDER_NOT_FOUND, conditions::SOURCE_PROVIDER_NOT_READY, "Source")
    } else {
        (conditions::DESTINATION_PROVIDER_NOT_FOUND, conditions::DESTINATION_PROVIDER_NOT_READY, "Destination")
    };
    match provider {
        None => out.push(Condition::critical(
            not_found,
            "NotFound",
            format!("{} provider '{}' not found.", role, reference.name),
        )),
        Some(p) if !p.is_ready() => out.push(Condition::critical(
            not_ready,
            "NotReady",
            format!("{} provider '{}' is not ready.", role, reference.name),
        )),
        Some(_) => {}
    }
}

fn map_condition<P>(out: &mut Vec<Condition>, map: Option<&ResolvedMap<P>>, type_: &str, kind: &str) {
    let Some(map) = map else { return };
    match &map.reference {
        None => out.push(Condition::critical(type_, "NotFound", format!("{} not found.", kind))),
        Some(reference) if !map.ready => out.push(Condition::critical(
            type_,
            "NotReady",
            format!("{} '{}' is not ready.", kind, reference.name),
        )),
        Some(_) => {}
    }
}

fn vm_label(vm: &PlanVm) -> &str {
    if vm.source.name.is_empty() { &vm.source.id } else { &vm.source.name }
}

/// VMs listed more than once, by id or by name
pub fn duplicate_vms(vms: &[PlanVm]) -> Vec<String> {
    let mut ids = BTreeSet::new();
    let mut names = BTreeSet::new();
    let mut out = Vec::new();
    for vm in vms {
        let id_seen = !vm.source.id.is_empty() && !ids.insert(vm.source.id.as_str());
        let name_seen = !vm.source.name.is_empty() && !names.insert(vm.source.name.as_str());
        if id_seen || name_seen {
            out.push(vm_label(vm).to_string());
        }
    }
    out
}

fn template_problem(source: Option<&str>, kind: TemplateKind, generate_name: bool) -> Option<String> {
    let source = source.filter(|s| !s.trim().is_empty())?;
    validate_template(source, kind, generate_name)
        .err()
        .map(|e| format!("'{}': {}", source, e))
}

fn template_conditions(out: &mut Vec<Condition>, plan: &Plan) {
    let spec = &plan.spec;
    let generate = spec.pvc_name_template_use_generate_name;
    let checks = [
        (conditions::PVC_NAME_TEMPLATE_NOT_VALID, TemplateKind::Pvc, "PVC"),
        (conditions::VOLUME_NAME_TEMPLATE_NOT_VALID, TemplateKind::Volume, "volume"),
        (conditions::NETWORK_NAME_TEMPLATE_NOT_VALID, TemplateKind::Network, "network"),
    ];
    for (type_, kind, what) in checks {
        let pick = |vm: Option<&PlanVm>| -> Option<String> {
            match (kind, vm) {
                (TemplateKind::Pvc, None) => spec.pvc_name_template.clone(),
                (TemplateKind::Volume, None) => spec.volume_name_template.clone(),
                (TemplateKind::Network, None) => spec.network_name_template.clone(),
                (TemplateKind::Pvc, Some(vm)) => vm.pvc_name_template.clone(),
                (TemplateKind::Volume, Some(vm)) => vm.volume_name_template.clone(),
                (TemplateKind::Network, Some(vm)) => vm.network_name_template.clone(),
            }
        };
        let mut problems: Vec<String> = template_problem(pick(None).as_deref(), kind, generate)
            .into_iter()
            .collect();
        for vm in &spec.vms {
            if let Some(problem) = template_problem(pick(Some(vm)).as_deref(), kind, generate) {
                problems.push(format!("VM {}: {}", vm_label(vm), problem));
            }
        }
        if !problems.is_empty() {
            out.push(Condition::critical(
                type_,
                "NotValid",
                format!("Invalid {} name template: {}.", what, problems.join("; ")),
            ));
        }
    }
}

fn unmapped_networks(nics: &[SourceNic], pairs: &[NetworkPair]) -> Vec<String> {
    let mut out: Vec<String> = nics
        .iter()
        .filter(|nic| !pairs.iter().any(|p| covers(&p.source, &nic.network.source, &nic.network.name)))
        .map(|nic| if nic.network.name.is_empty() { nic.network.source.key().to_string() } else { nic.network.name.clone() })
        .collect();
    out.dedup();
    out
}

fn unmapped_storages(disks: &[SourceDisk], pairs: &[StoragePair]) -> Vec<String> {
    let mut out: Vec<String> = disks
        .iter()
        .filter(|disk| !pairs.iter().any(|p| covers(&p.source, &disk.storage.source, &disk.storage.name)))
        .map(|disk| if disk.storage.name.is_empty() { disk.storage.source.key().to_string() } else { disk.storage.name.clone() })
        .collect();
    out.dedup();
    out
}

/// Full condition set of a plan. Pure: everything it needs is in `inputs`.
pub fn validate(plan: &Plan, inputs: &PlanInputs) -> Vec<Condition> {
    if plan.spec.archived {
        return vec![Condition::advisory(types::ARCHIVED, "Archived", "The plan is archived.")];
    }
    let spec = &plan.spec;
    let mode = spec.migration_type();
    let mut out = Vec::new();

    provider_conditions(&mut out, inputs.source.as_ref(), &spec.provider.source, true);
    provider_conditions(&mut out, inputs.destination.as_ref(), &spec.provider.destination, false);

    if spec.warm_flag_conflict() {
        out.push(Condition::critical(
            conditions::WARM_FLAG_CONFLICT,
            "Conflict",
            format!("The warm flag conflicts with migration type '{}'.", mode.as_str()),
        ));
    }
    if mode == MigrationType::Conversion && (spec.map.storage.is_some() || spec.storage_pairs.is_some()) {
        out.push(Condition::critical(
            conditions::CONVERSION_WITH_STORAGE_MAP,
            "NotValid",
            "A conversion-only plan must not have a storage mapping.",
        ));
    }
    if let Some(source) = &inputs.source {
        let type_ = source.spec.type_;
        if mode == MigrationType::Warm && !type_.supports_warm() {
            out.push(Condition::critical(
                conditions::WARM_NOT_SUPPORTED,
                "NotSupported",
                format!("Warm migration is not supported for {} providers.", type_.as_str()),
            ));
        }
        if mode == MigrationType::Live && !type_.supports_live() {
            out.push(Condition::critical(
                conditions::LIVE_NOT_SUPPORTED,
                "NotSupported",
                format!("Live migration is not supported for {} providers.", type_.as_str()),
            ));
        }
    }

    map_condition(&mut out, inputs.network.as_ref(), conditions::NETWORK_MAP_NOT_READY, "Network map");
    if mode != MigrationType::Conversion {
        map_condition(&mut out, inputs.storage.as_ref(), conditions::STORAGE_MAP_NOT_READY, "Storage map");
    }

    let duplicates = duplicate_vms(&spec.vms);
    if !duplicates.is_empty() {
        out.push(Condition::critical(
            conditions::DUPLICATE_VM,
            "Duplicate",
            format!("VMs listed more than once: {}.", duplicates.join(", ")),
        ));
    }

    let mut not_found = Vec::new();
    let mut networks = Vec::new();
    let mut storages = Vec::new();
    for (vm, inventory) in spec.vms.iter().zip(inputs.vms.iter()) {
        let Some(inventory) = inventory else {
            not_found.push(vm_label(vm).to_string());
            continue;
        };
        if let Some(map) = &inputs.network {
            let missing = unmapped_networks(&inventory.nics, &map.pairs);
            if !missing.is_empty() {
                networks.push(format!("{} ({})", vm_label(vm), missing.join(", ")));
            }
        }
        if let Some(map) = inputs.storage.as_ref().filter(|_| mode != MigrationType::Conversion) {
            let missing = unmapped_storages(&inventory.disks, &map.pairs);
            if !missing.is_empty() {
                storages.push(format!("{} ({})", vm_label(vm), missing.join(", ")));
            }
        }
    }
    if !not_found.is_empty() {
        out.push(Condition::critical(
            conditions::VM_NOT_FOUND,
            "NotFound",
            format!("VMs not found in the source inventory: {}.", not_found.join(", ")),
        ));
    }
    if !networks.is_empty() {
        out.push(Condition::critical(
            conditions::VM_NETWORKS_NOT_MAPPED,
            "NotMapped",
            format!("VM networks without a mapping: {}.", networks.join(", ")),
        ));
    }
    if !storages.is_empty() {
        out.push(Condition::critical(
            conditions::VM_STORAGE_NOT_MAPPED,
            "NotMapped",
            format!("VM storage without a mapping: {}.", storages.join(", ")),
        ));
    }

    template_conditions(&mut out, plan);

    let namespace = target_namespace(plan);
    if !is_dns1123_label(&namespace) {
        out.push(Condition::critical(
            conditions::TARGET_NAMESPACE_NOT_VALID,
            "NotValid",
            format!("Target namespace '{}' is not a valid DNS-1123 label.", namespace),
        ));
    } else if inputs.target_namespace_exists == Some(false) {
        out.push(Condition::critical(
            conditions::TARGET_NAMESPACE_NOT_VALID,
            "NotFound",
            format!("Target namespace '{}' does not exist.", namespace),
        ));
    }

    if !inputs.hook_problems.is_empty() {
        out.push(Condition::critical(
            conditions::HOOK_NOT_VALID,
            "NotValid",
            format!("{}.", inputs.hook_problems.join("; ")),
        ));
    }

    if !has_blocker(&out) {
        out.push(Condition::ready("The migration plan is ready."));
    }
    out
}

/// Status to store: `desired` conditions merged with the migration outcome conditions and
/// history already present
pub fn plan_status(plan: &Plan, inputs: &PlanInputs, desired: Vec<Condition>) -> PlanStatus {
    let current = plan.status.clone().unwrap_or_default();
    PlanStatus {
        conditions: merge_conditions(&current.conditions, desired, MIGRATION_CONDITIONS, Utc::now()),
        observed_generation: plan.meta().generation,
        network_map: inputs.network.as_ref().and_then(|m| m.reference.clone()).or(current.network_map),
        storage_map: inputs.storage.as_ref().and_then(|m| m.reference.clone()).or(current.storage_map),
        migration: current.migration,
    }
}

/// Find a plan VM in the source inventory, `None` when it does not exist
pub(crate) async fn find_source_vm(
    inventory: &dyn InventoryClientTrait,
    provider_type: ProviderType,
    provider_uid: &str,
    vm: &SourceRef,
) -> Result<Option<SourceVm>, ControllerError> {
    if !vm.id.is_empty() {
        return match inventory.get_vm(provider_type, provider_uid, &vm.id).await {
            Ok(found) => Ok(Some(found)),
            Err(InventoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        };
    }
    Ok(inventory.find_vm(provider_type, provider_uid, &vm.name).await?)
}

/// Labels of the maps a plan stores its inline or synthesized pairs in
fn owned_map_meta(plan: &Plan, suffix: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(format!("{}-{}", plan.name_any(), suffix)),
        namespace: plan.namespace(),
        labels: Some(BTreeMap::from([(labels::PLAN.to_string(), plan.uid().unwrap_or_default())])),
        owner_references: owner_reference(plan).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

/// A map is usable once its controller reported Ready without blockers
fn map_ready(status: Option<&MapStatus>) -> bool {
    status.is_some_and(|s| crds::is_condition_true(&s.conditions, types::READY) && !has_blocker(&s.conditions))
}

impl Reconciler {
    /// Reconciles a Plan.
    pub async fn reconcile_plan(&self, plan: &Plan) -> Result<Action, ControllerError> {
        let key = object_key(plan);
        info!("Reconciling {}", key);

        let inputs = if plan.spec.archived { PlanInputs::default() } else { self.plan_inputs(plan).await? };
        let desired = validate(plan, &inputs);
        let ready = !has_blocker(&desired) && crds::find_condition(&desired, types::READY).is_some();
        let status = plan_status(plan, &inputs, desired);
        let outcome = self.write_status(plan, plan.status.as_ref(), &status).await?;
        debug!("{} status: {:?}", key, outcome);

        if ready {
            if let (Some(source), Some(destination)) = (&inputs.source, &inputs.destination) {
                let labels = MigrationLabels::new(source, destination, plan.spec.migration_type());
                self.metrics.record_plan_status(&plan.uid().unwrap_or_default(), types::READY, &labels);
            }
        }
        self.reconciled(&key);
        if ready || plan.spec.archived {
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(self.config.poll_interval))
        }
    }

    async fn plan_inputs(&self, plan: &Plan) -> Result<PlanInputs, ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        let spec = &plan.spec;
        let mut inputs = PlanInputs {
            source: self.lookup::<Provider>(&spec.provider.source, &namespace).await?,
            destination: self.lookup::<Provider>(&spec.provider.destination, &namespace).await?,
            ..PlanInputs::default()
        };
        inputs.hook_problems = self.hook_problems(plan).await?;

        let target_ns = target_namespace(plan);
        if inputs.destination.as_ref().is_some_and(Provider::is_host) && is_dns1123_label(&target_ns) {
            let namespaces: Api<Namespace> = Api::all(self.client.clone());
            let found = self.call("get target namespace", namespaces.get_opt(&target_ns)).await?;
            inputs.target_namespace_exists = Some(found.is_some());
        }

        let source = inputs.source.clone().filter(Provider::is_ready);
        let destination = inputs.destination.clone().filter(Provider::is_ready);
        let (Some(source), Some(destination)) = (source, destination) else {
            debug!("{}: providers not usable, skipping inventory checks", object_key(plan));
            return Ok(inputs);
        };

        let source_uid = source.uid().unwrap_or_default();
        let ctx = SourceContext {
            inventory: self.inventory.as_ref(),
            provider_type: source.spec.type_,
            provider_uid: &source_uid,
        };
        let family = source_family(source.spec.type_);
        let mut found = Vec::new();
        for vm in &spec.vms {
            let Some(source_vm) = self
                .call("find source VM", find_source_vm(self.inventory.as_ref(), source.spec.type_, &source_uid, &vm.source))
                .await?
            else {
                inputs.vms.push(None);
                continue;
            };
            let nics = self.call("list VM NICs", family.nics(&ctx, &source_vm)).await?;
            let disks = self.call("list VM disks", family.disks(&ctx, &source_vm)).await?;
            inputs.vms.push(Some(VmInventory { nics, disks }));
            found.push(source_vm);
        }

        let destination_uid = destination.uid().unwrap_or_default();
        let targets = InventoryTargets::new(self.inventory.as_ref(), &destination_uid);
        inputs.network = Some(self.resolve_network_map(plan, &ctx, &found, &targets, &source, &destination).await?);
        if spec.migration_type() != MigrationType::Conversion {
            inputs.storage = Some(self.resolve_storage_map(plan, &ctx, &found, &targets).await?);
        }
        Ok(inputs)
    }

    async fn hook_problems(&self, plan: &Plan) -> Result<Vec<String>, ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        let mut seen = BTreeSet::new();
        let mut problems = Vec::new();
        for hook_ref in plan.spec.vms.iter().flat_map(|vm| vm.hooks.iter()) {
            let reference = &hook_ref.hook;
            if !seen.insert((reference.namespace_or(&namespace).to_string(), reference.name.clone())) {
                continue;
            }
            match self.lookup::<Hook>(reference, &namespace).await? {
                None => problems.push(format!("hook '{}' not found", reference.name)),
                Some(hook) => {
                    let ready = hook.status.as_ref().is_some_and(|s| {
                        crds::is_condition_true(&s.conditions, types::READY) && !has_blocker(&s.conditions)
                    });
                    if !ready {
                        problems.push(format!("hook '{}' is not ready", reference.name));
                    }
                }
            }
        }
        Ok(problems)
    }

    async fn resolve_network_map(
        &self,
        plan: &Plan,
        ctx: &SourceContext<'_>,
        vms: &[SourceVm],
        targets: &InventoryTargets<'_>,
        source: &Provider,
        destination: &Provider,
    ) -> Result<ResolvedMap<NetworkPair>, ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        if let Some(reference) = &plan.spec.map.network {
            let map = self.lookup::<NetworkMap>(reference, &namespace).await?;
            return Ok(ResolvedMap {
                reference: map.as_ref().map(|_| reference.clone()),
                ready: map.as_ref().is_some_and(|m| map_ready(m.status.as_ref())),
                pairs: map.map(|m| m.spec.map).unwrap_or_default(),
                origin: MapOrigin::Explicit,
            });
        }

        let (pairs, origin) = match plan.spec.network_pairs.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(expr) => {
                let parsed = parse_network_pairs(expr, &namespace)?;
                (parsed.iter().map(NetworkPair::from).collect(), MapOrigin::Inline)
            }
            None => {
                let sources = self.call("list source networks", source_networks(ctx, vms)).await?;
                let target_ns = target_namespace(plan);
                let nads = self.call("list network attachment definitions", targets.network_attachments(Some(target_ns.as_str()))).await?;
                let kubevirt = source.spec.type_ == ProviderType::OpenShift && destination.spec.type_ == ProviderType::OpenShift;
                let pairs = network::resolve(&sources, &nads, plan.spec.default_target_network.as_deref(), &target_ns, kubevirt);
                (pairs, MapOrigin::Synthesized)
            }
        };
        let reference = self.ensure_network_map(plan, &pairs).await?;
        Ok(ResolvedMap { reference: Some(reference), pairs, origin, ready: true })
    }

    async fn resolve_storage_map(
        &self,
        plan: &Plan,
        ctx: &SourceContext<'_>,
        vms: &[SourceVm],
        targets: &InventoryTargets<'_>,
    ) -> Result<ResolvedMap<StoragePair>, ControllerError> {
        let namespace = plan.namespace().unwrap_or_default();
        if let Some(reference) = &plan.spec.map.storage {
            let map = self.lookup::<StorageMap>(reference, &namespace).await?;
            return Ok(ResolvedMap {
                reference: map.as_ref().map(|_| reference.clone()),
                ready: map.as_ref().is_some_and(|m| map_ready(m.status.as_ref())),
                pairs: map.map(|m| m.spec.map).unwrap_or_default(),
                origin: MapOrigin::Explicit,
            });
        }

        let (pairs, origin) = match plan.spec.storage_pairs.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(expr) => {
                let parsed = parse_storage_pairs(expr)?;
                (parsed.iter().map(StoragePair::from).collect(), MapOrigin::Inline)
            }
            None => {
                let sources = self.call("list source storages", source_storages(ctx, vms)).await?;
                let classes = self.call("list storage classes", targets.storage_classes()).await?;
                if classes.is_empty() {
                    warn!("{}: destination has no storage class", object_key(plan));
                }
                let pairs = storage::resolve(&sources, &classes, ctx.provider_type == ProviderType::Ec2);
                (pairs, MapOrigin::Synthesized)
            }
        };
        let reference = self.ensure_storage_map(plan, &pairs).await?;
        Ok(ResolvedMap { reference: Some(reference), pairs, origin, ready: true })
    }

    async fn ensure_network_map(&self, plan: &Plan, pairs: &[NetworkPair]) -> Result<ResourceRef, ControllerError> {
        let metadata = owned_map_meta(plan, "network");
        let name = metadata.name.clone().unwrap_or_default();
        let namespace = plan.namespace().unwrap_or_default();
        let api: Api<NetworkMap> = self.api(&namespace);
        let spec = NetworkMapSpec { provider: plan.spec.provider.clone(), map: pairs.to_vec() };
        match self.call("get network map", api.get_opt(&name)).await? {
            Some(existing) if existing.spec == spec => {}
            Some(mut existing) => {
                info!("Replacing pairs of NetworkMap {}/{}", namespace, name);
                existing.spec = spec;
                self.call("replace network map", api.replace(&name, &PostParams::default(), &existing)).await?;
            }
            None => {
                info!("Creating NetworkMap {}/{}", namespace, name);
                let map = NetworkMap { metadata, spec, status: None };
                self.call("create network map", api.create(&PostParams::default(), &map)).await?;
            }
        }
        Ok(ResourceRef::with_namespace(name, namespace))
    }

    async fn ensure_storage_map(&self, plan: &Plan, pairs: &[StoragePair]) -> Result<ResourceRef, ControllerError> {
        let metadata = owned_map_meta(plan, "storage");
        let name = metadata.name.clone().unwrap_or_default();
        let namespace = plan.namespace().unwrap_or_default();
        let api: Api<StorageMap> = self.api(&namespace);
        let spec = StorageMapSpec { provider: plan.spec.provider.clone(), map: pairs.to_vec() };
        match self.call("get storage map", api.get_opt(&name)).await? {
            Some(existing) if existing.spec == spec => {}
            Some(mut existing) => {
                info!("Replacing pairs of StorageMap {}/{}", namespace, name);
                existing.spec = spec;
                self.call("replace storage map", api.replace(&name, &PostParams::default(), &existing)).await?;
            }
            None => {
                info!("Creating StorageMap {}/{}", namespace, name);
                let map = StorageMap { metadata, spec, status: None };
                self.call("create storage map", api.create(&PostParams::default(), &map)).await?;
            }
        }
        Ok(ResourceRef::with_namespace(name, namespace))
    }
}

/// Network destinations of a VM's NICs, in NIC order; NICs without a pair are ignored
pub fn nic_destinations(nics: &[SourceNic], pairs: &[NetworkPair]) -> Vec<crds::NetworkDestination> {
    nics.iter()
        .map(|nic| {
            pairs
                .iter()
                .find(|p| covers(&p.source, &nic.network.source, &nic.network.name))
                .map(|p| p.destination.clone())
                .unwrap_or_else(crds::NetworkDestination::ignored)
        })
        .collect()
}

/// Storage destination of a disk, `None` when no pair covers its storage
pub fn disk_destination<'a>(disk: &SourceDisk, pairs: &'a [StoragePair]) -> Option<&'a crds::StorageDestination> {
    pairs
        .iter()
        .find(|p| covers(&p.source, &disk.storage.source, &disk.storage.name))
        .map(|p| &p.destination)
}
