//! The KubeVirt VirtualMachine created at the end of a pipeline.

use super::{render_or, VmContext};
use crate::error::ControllerError;
use crate::reconcile_helpers::merge_labels;
use crate::template::{TemplateData, Value};
use crds::{NetworkDestination, NetworkType, PowerState, TargetPowerState};
use inventory_client::SourceVm;
use kube::api::DynamicObject;
use serde_json::json;

/// CPU, memory and firmware of the source guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestShape {
    /// Virtual CPU cores
    pub cores: u32,
    /// Guest memory in MiB
    pub memory_mib: u64,
    /// UEFI firmware
    pub efi: bool,
    /// CPU model to keep (oVirt cluster model)
    pub cpu_model: Option<String>,
}

impl Default for GuestShape {
    fn default() -> Self {
        Self { cores: 1, memory_mib: 2048, efi: false, cpu_model: None }
    }
}

/// Shape of a source VM as the inventory reports it
pub fn guest_shape(vm: &SourceVm, preserve_cluster_cpu_model: bool) -> GuestShape {
    let base = GuestShape::default();
    match vm {
        SourceVm::VSphere(v) => GuestShape {
            cores: v.cpu_count.max(1),
            memory_mib: v.memory_mb.max(1),
            efi: v.firmware.eq_ignore_ascii_case("efi"),
            ..base
        },
        SourceVm::OVirt(v) => GuestShape {
            cores: v.cpu_cores.max(1),
            memory_mib: (v.memory >> 20).max(1),
            efi: v.bios_type.contains("ovmf"),
            cpu_model: v
                .custom_cpu_model
                .clone()
                .or_else(|| if preserve_cluster_cpu_model { v.cluster_cpu_model.clone() } else { None }),
        },
        SourceVm::OpenStack(v) => match &v.flavor {
            Some(flavor) => GuestShape { cores: flavor.vcpus.max(1), memory_mib: flavor.ram.max(1), ..base },
            None => base,
        },
        SourceVm::Ova(v) => GuestShape {
            cores: v.cpu_count.max(1),
            memory_mib: v.memory_mb.max(1),
            efi: v.firmware.eq_ignore_ascii_case("efi"),
            ..base
        },
        SourceVm::HyperV(v) => GuestShape {
            cores: v.cpu_count.max(1),
            memory_mib: v.memory_mb.max(1),
            efi: v.generation >= 2,
            ..base
        },
        SourceVm::Ec2(_) | SourceVm::OpenShift(_) => base,
    }
}

/// A NIC of the target VM, already mapped to its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNic {
    /// MAC address to keep, empty for a generated one
    pub mac: String,
    /// Mapped destination
    pub destination: NetworkDestination,
}

/// `runStrategy` of the target VM
pub fn run_strategy(desired: TargetPowerState, source_was: Option<PowerState>) -> &'static str {
    let on = match desired {
        TargetPowerState::On => true,
        TargetPowerState::Off => false,
        TargetPowerState::Auto => source_was == Some(PowerState::On),
    };
    if on { "Always" } else { "Halted" }
}

fn network_data(nic: &TargetNic, index: usize) -> TemplateData {
    let (kind, name, namespace) = match nic.destination.type_ {
        NetworkType::Multus => (
            "Multus",
            nic.destination.name.clone().unwrap_or_default(),
            nic.destination.namespace.clone().unwrap_or_default(),
        ),
        _ => ("Pod", "pod".to_string(), String::new()),
    };
    TemplateData::from([
        ("NetworkName", Value::from(name)),
        ("NetworkNamespace", Value::from(namespace)),
        ("NetworkType", Value::from(kind)),
        ("NetworkIndex", Value::from(index)),
    ])
}

/// VirtualMachine of one migrated VM; `claims` are the target claims in disk order
pub fn build_virtual_machine(
    ctx: &VmContext<'_>,
    shape: &GuestShape,
    claims: &[String],
    nics: &[TargetNic],
) -> Result<DynamicObject, ControllerError> {
    let spec = &ctx.plan.spec;
    let compat = spec.use_compatibility_mode;
    let root = usize::try_from(ctx.plan_vm.root_disk_index.unwrap_or(0)).unwrap_or(usize::MAX);
    let volume_template = ctx.plan_vm.volume_name_template.as_deref().or(spec.volume_name_template.as_deref());
    let network_template = ctx.plan_vm.network_name_template.as_deref().or(spec.network_name_template.as_deref());

    let mut disks = Vec::new();
    let mut volumes = Vec::new();
    for (index, claim) in claims.iter().enumerate() {
        let data = TemplateData::from([
            ("PVCName", Value::from(claim.as_str())),
            ("VolumeIndex", Value::from(index)),
        ]);
        let name = render_or(volume_template, &data, format!("vol-{}", index))?;
        let mut disk = json!({ "name": name, "disk": { "bus": if compat { "sata" } else { "virtio" } } });
        if index == root {
            disk["bootOrder"] = json!(1);
        }
        disks.push(disk);
        volumes.push(json!({ "name": name, "persistentVolumeClaim": { "claimName": claim } }));
    }

    let mut interfaces = Vec::new();
    let mut networks = Vec::new();
    for (index, nic) in nics.iter().filter(|n| n.destination.type_ != NetworkType::Ignored).enumerate() {
        let name = render_or(network_template, &network_data(nic, index), format!("net-{}", index))?;
        let mut interface = json!({ "name": name, "model": if compat { "e1000e" } else { "virtio" } });
        if !nic.mac.is_empty() {
            interface["macAddress"] = json!(nic.mac);
        }
        match nic.destination.type_ {
            NetworkType::Multus => {
                interface["bridge"] = json!({});
                let target = match &nic.destination.namespace {
                    Some(ns) => format!("{}/{}", ns, nic.destination.name.as_deref().unwrap_or_default()),
                    None => nic.destination.name.clone().unwrap_or_default(),
                };
                networks.push(json!({ "name": name, "multus": { "networkName": target } }));
            }
            _ => {
                interface["masquerade"] = json!({});
                networks.push(json!({ "name": name, "pod": {} }));
            }
        }
        interfaces.push(interface);
    }

    let mut domain = json!({
        "cpu": { "cores": shape.cores },
        "memory": { "guest": format!("{}Mi", shape.memory_mib) },
        "firmware": { "bootloader": if shape.efi { json!({ "efi": { "secureBoot": false } }) } else { json!({ "bios": {} }) } },
        "devices": { "disks": disks, "interfaces": interfaces },
    });
    if let Some(model) = &shape.cpu_model {
        domain["cpu"]["model"] = json!(model);
    }

    let labels = merge_labels(&ctx.labels(), &spec.target_labels);
    let mut template_spec = json!({ "domain": domain, "networks": networks, "volumes": volumes });
    if !spec.target_node_selector.is_empty() {
        template_spec["nodeSelector"] = json!(spec.target_node_selector);
    }
    if let Some(affinity) = &spec.target_affinity {
        template_spec["affinity"] = affinity.clone();
    }

    let obj = json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {
            "name": ctx.target_name(),
            "namespace": ctx.namespace(),
            "labels": labels,
        },
        "spec": {
            "runStrategy": run_strategy(spec.target_power_state, ctx.vm.restore_power_state),
            "template": {
                "metadata": { "labels": spec.target_labels },
                "spec": template_spec,
            },
        },
    });
    Ok(serde_json::from_value(obj)?)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use inventory_client::VSphereVm;
    use std::collections::BTreeMap;

    #[test]
    fn test_run_strategy() {
        assert_eq!(run_strategy(TargetPowerState::On, None), "Always");
        assert_eq!(run_strategy(TargetPowerState::Off, Some(PowerState::On)), "Halted");
        assert_eq!(run_strategy(TargetPowerState::Auto, Some(PowerState::On)), "Always");
        assert_eq!(run_strategy(TargetPowerState::Auto, Some(PowerState::Off)), "Halted");
        assert_eq!(run_strategy(TargetPowerState::Auto, None), "Halted");
    }

    #[test]
    fn test_guest_shape() {
        let vm = SourceVm::VSphere(VSphereVm {
            cpu_count: 4,
            memory_mb: 8192,
            firmware: "efi".into(),
            ..Default::default()
        });
        let shape = guest_shape(&vm, false);
        assert_eq!(shape, GuestShape { cores: 4, memory_mib: 8192, efi: true, cpu_model: None });
    }

    #[test]
    fn test_virtual_machine() {
        let (mut plan, mut plan_vm, mut vm) = (plan(), plan_vm(), vm_status());
        plan.spec.target_labels = BTreeMap::from([("team".to_string(), "web".to_string())]);
        plan.spec.target_node_selector = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        plan.spec.network_name_template = Some("{{.NetworkType | lower}}-{{.NetworkIndex}}".into());
        plan_vm.root_disk_index = Some(1);
        vm.restore_power_state = Some(PowerState::On);
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "0123456789" };

        let nics = vec![
            TargetNic { mac: "00:50:56:aa:bb:cc".into(), destination: NetworkDestination::multus(Some("ns1".into()), "prod") },
            TargetNic { mac: String::new(), destination: NetworkDestination::ignored() },
            TargetNic { mac: String::new(), destination: NetworkDestination::pod() },
        ];
        let claims = vec!["web-disk-0".to_string(), "web-disk-1".to_string()];
        let obj = build_virtual_machine(&ctx, &GuestShape::default(), &claims, &nics).unwrap();

        assert_eq!(obj.metadata.name.as_deref(), Some("web-01"));
        let labels = obj.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["team"], "web");
        assert_eq!(labels["vmID"], "vm-42");
        let spec = &obj.data["spec"];
        assert_eq!(spec["runStrategy"], "Always");
        let template = &spec["template"]["spec"];
        assert_eq!(template["nodeSelector"]["zone"], "a");
        let disks = template["domain"]["devices"]["disks"].as_array().unwrap();
        assert!(disks[0].get("bootOrder").is_none());
        assert_eq!(disks[1]["bootOrder"], 1);
        assert_eq!(template["volumes"][0]["persistentVolumeClaim"]["claimName"], "web-disk-0");
        let networks = template["networks"].as_array().unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0]["name"], "multus-0");
        assert_eq!(networks[0]["multus"]["networkName"], "ns1/prod");
        assert_eq!(networks[1]["name"], "pod-1");
        let interfaces = template["domain"]["devices"]["interfaces"].as_array().unwrap();
        assert_eq!(interfaces[0]["macAddress"], "00:50:56:aa:bb:cc");
    }
}
