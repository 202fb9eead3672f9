//! Per-family source fetchers.

use super::{names, SourceContext, SourceDisk, SourceNetwork, SourceNetworkFetcher, SourceNic, SourceStorage, SourceStorageFetcher, POD_NETWORK};
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::SourceRef;
use inventory_client::{Network, Ref, SourceVm, VSphereNic};
use std::collections::BTreeMap;

const GIB: u64 = 1 << 30;

fn unexpected(ctx: &SourceContext<'_>, vm: &SourceVm) -> ControllerError {
    ControllerError::Validation(format!("VM {} is not a {} VM", vm.id(), ctx.provider_type.as_str()))
}

async fn network_names(ctx: &SourceContext<'_>) -> Result<BTreeMap<String, String>, ControllerError> {
    let networks = ctx.inventory.list_networks(ctx.provider_type, ctx.provider_uid).await?;
    Ok(names(networks.into_iter().map(|n| (n.id, n.name))))
}

async fn storage_names(ctx: &SourceContext<'_>) -> Result<BTreeMap<String, String>, ControllerError> {
    let storages = ctx.inventory.list_storages(ctx.provider_type, ctx.provider_uid).await?;
    Ok(names(storages.into_iter().map(|s| (s.id, s.name))))
}

fn network_by_id(id: &str, names: &BTreeMap<String, String>) -> SourceNetwork {
    SourceNetwork {
        source: SourceRef::by_id(id),
        name: names.get(id).cloned().unwrap_or_default(),
        pod: false,
    }
}

fn storage_by_id(id: &str, names: &BTreeMap<String, String>) -> SourceStorage {
    SourceStorage {
        source: SourceRef::by_id(id),
        name: names.get(id).cloned().unwrap_or_default(),
    }
}

/// NICs from explicit NIC records, falling back to bare network references
fn ref_nics(nics: &[VSphereNic], networks: &[Ref], names: &BTreeMap<String, String>) -> Vec<SourceNic> {
    if nics.is_empty() {
        return networks
            .iter()
            .map(|n| SourceNic { mac: String::new(), network: network_by_id(&n.id, names) })
            .collect();
    }
    nics.iter()
        .map(|nic| SourceNic { mac: nic.mac.clone(), network: network_by_id(&nic.network.id, names) })
        .collect()
}

/// vSphere: NIC network and disk datastore ids
pub struct VSphereFamily;

#[async_trait]
impl SourceNetworkFetcher for VSphereFamily {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let SourceVm::VSphere(vm) = vm else { return Err(unexpected(ctx, vm)) };
        Ok(ref_nics(&vm.nics, &vm.networks, &network_names(ctx).await?))
    }
}

#[async_trait]
impl SourceStorageFetcher for VSphereFamily {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let SourceVm::VSphere(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let names = storage_names(ctx).await?;
        Ok(vm
            .disks
            .iter()
            .map(|d| SourceDisk {
                id: d.key.to_string(),
                storage: storage_by_id(&d.datastore.id, &names),
                capacity: d.capacity,
                file: d.file.clone(),
                shared: d.shared,
            })
            .collect())
    }
}

/// oVirt: vNIC profile to network, disk attachment to storage domain
pub struct OvirtFamily;

#[async_trait]
impl SourceNetworkFetcher for OvirtFamily {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let SourceVm::OVirt(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let names = network_names(ctx).await?;
        let mut nics = Vec::with_capacity(vm.nics.len());
        // a NIC without a profile is unplugged and has no network
        for nic in vm.nics.iter().filter(|n| !n.profile.is_empty()) {
            let profile = ctx.inventory.get_nic_profile(ctx.provider_uid, &nic.profile).await?;
            nics.push(SourceNic { mac: nic.mac.clone(), network: network_by_id(&profile.network, &names) });
        }
        Ok(nics)
    }
}

#[async_trait]
impl SourceStorageFetcher for OvirtFamily {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let SourceVm::OVirt(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let names = storage_names(ctx).await?;
        let mut disks = Vec::with_capacity(vm.disk_attachments.len());
        for attachment in &vm.disk_attachments {
            let disk = ctx.inventory.get_ovirt_disk(ctx.provider_uid, &attachment.disk).await?;
            disks.push(SourceDisk {
                id: disk.id.clone(),
                storage: storage_by_id(&disk.storage_domain, &names),
                capacity: disk.provisioned_size,
                file: String::new(),
                shared: disk.shared,
            });
        }
        Ok(disks)
    }
}

/// Network whose name best matches an OpenStack address-map key: exact, case-insensitive,
/// then substring either way
pub fn fuzzy_network<'a>(key: &str, networks: &'a [Network]) -> Option<&'a Network> {
    let lower = key.to_lowercase();
    networks
        .iter()
        .find(|n| n.name == key)
        .or_else(|| networks.iter().find(|n| n.name.to_lowercase() == lower))
        .or_else(|| {
            networks.iter().find(|n| {
                let name = n.name.to_lowercase();
                !name.is_empty() && (name.contains(&lower) || lower.contains(&name))
            })
        })
}

/// OpenStack: address-map keys to networks, attached volumes to volume types
pub struct OpenstackFamily;

#[async_trait]
impl SourceNetworkFetcher for OpenstackFamily {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let SourceVm::OpenStack(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let networks = ctx.inventory.list_networks(ctx.provider_type, ctx.provider_uid).await?;
        let mut nics: Vec<SourceNic> = Vec::new();
        for (key, addresses) in &vm.addresses {
            let network = match fuzzy_network(key, &networks) {
                Some(n) => SourceNetwork { source: SourceRef::by_id(&n.id), name: n.name.clone(), pod: false },
                None => SourceNetwork { source: SourceRef::by_name(key), name: key.clone(), pod: false },
            };
            // one NIC per MAC: an interface with v4 and v6 addresses is listed twice
            let mut macs: Vec<&str> = addresses.iter().map(|a| a.mac.as_str()).collect();
            macs.dedup();
            if macs.is_empty() {
                macs.push("");
            }
            for mac in macs {
                nics.push(SourceNic { mac: mac.to_string(), network: network.clone() });
            }
        }
        Ok(nics)
    }
}

#[async_trait]
impl SourceStorageFetcher for OpenstackFamily {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let SourceVm::OpenStack(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let types = ctx.inventory.list_storages(ctx.provider_type, ctx.provider_uid).await?;
        let mut disks = Vec::with_capacity(vm.attached_volumes.len());
        for attached in &vm.attached_volumes {
            let volume = ctx.inventory.get_openstack_volume(ctx.provider_uid, &attached.id).await?;
            let storage = match types.iter().find(|t| t.name == volume.volume_type || t.id == volume.volume_type) {
                Some(t) => SourceStorage { source: SourceRef::by_id(&t.id), name: t.name.clone() },
                None => SourceStorage { source: SourceRef::by_name(&volume.volume_type), name: volume.volume_type.clone() },
            };
            disks.push(SourceDisk {
                id: volume.id.clone(),
                storage,
                capacity: volume.size * GIB,
                file: String::new(),
                shared: false,
            });
        }
        Ok(disks)
    }
}

/// EC2: ENI subnets, EBS volume types referenced by name
pub struct Ec2Family;

#[async_trait]
impl SourceNetworkFetcher for Ec2Family {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let SourceVm::Ec2(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let names = network_names(ctx).await?;
        Ok(vm
            .network_interfaces
            .iter()
            .map(|eni| SourceNic { mac: eni.mac.clone(), network: network_by_id(&eni.subnet_id, &names) })
            .collect())
    }
}

#[async_trait]
impl SourceStorageFetcher for Ec2Family {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let SourceVm::Ec2(vm) = vm else { return Err(unexpected(ctx, vm)) };
        let mut disks = Vec::with_capacity(vm.block_devices.len());
        for device in &vm.block_devices {
            let volume = ctx.inventory.get_ec2_volume(ctx.provider_uid, &device.volume_id).await?;
            disks.push(SourceDisk {
                id: volume.id.clone(),
                storage: SourceStorage { source: SourceRef::by_name(&volume.volume_type), name: volume.volume_type.clone() },
                capacity: volume.size * GIB,
                file: device.device_name.clone(),
                shared: false,
            });
        }
        Ok(disks)
    }
}

/// OVA and Hyper-V: disk images are mapped one by one
pub struct ImageFamily;

#[async_trait]
impl SourceNetworkFetcher for ImageFamily {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let (nics, networks) = match vm {
            SourceVm::Ova(vm) => (&vm.nics, &vm.networks),
            SourceVm::HyperV(vm) => (&vm.nics, &vm.networks),
            _ => return Err(unexpected(ctx, vm)),
        };
        Ok(ref_nics(nics, networks, &network_names(ctx).await?))
    }
}

#[async_trait]
impl SourceStorageFetcher for ImageFamily {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let disks = match vm {
            SourceVm::Ova(vm) => &vm.disks,
            SourceVm::HyperV(vm) => &vm.disks,
            _ => return Err(unexpected(ctx, vm)),
        };
        Ok(disks
            .iter()
            .map(|d| SourceDisk {
                id: d.id.clone(),
                storage: SourceStorage { source: SourceRef::by_id(&d.id), name: d.file_path.clone() },
                capacity: d.capacity,
                file: d.file_path.clone(),
                shared: false,
            })
            .collect())
    }
}

/// Last path segment of a multus network reference ("ns/name" or "name")
pub fn multus_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

/// KubeVirt: pod and multus networks, claims by storage class
pub struct OpenshiftFamily;

#[async_trait]
impl SourceNetworkFetcher for OpenshiftFamily {
    async fn nics(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceNic>, ControllerError> {
        let SourceVm::OpenShift(vm) = vm else { return Err(unexpected(ctx, vm)) };
        Ok(vm
            .networks
            .iter()
            .filter_map(|n| {
                let network = match (&n.multus, n.pod) {
                    (_, true) => SourceNetwork { source: SourceRef::by_name(POD_NETWORK), name: POD_NETWORK.to_string(), pod: true },
                    (Some(multus), false) => SourceNetwork {
                        source: SourceRef::by_name(multus),
                        name: multus_name(multus).to_string(),
                        pod: false,
                    },
                    (None, false) => return None,
                };
                Some(SourceNic { mac: n.mac.clone(), network })
            })
            .collect())
    }
}

#[async_trait]
impl SourceStorageFetcher for OpenshiftFamily {
    async fn disks(&self, ctx: &SourceContext<'_>, vm: &SourceVm) -> Result<Vec<SourceDisk>, ControllerError> {
        let SourceVm::OpenShift(vm) = vm else { return Err(unexpected(ctx, vm)) };
        Ok(vm
            .volumes
            .iter()
            .map(|v| SourceDisk {
                id: v.claim_name.clone(),
                storage: SourceStorage { source: SourceRef::by_name(&v.storage_class), name: v.storage_class.clone() },
                capacity: v.capacity,
                file: v.name.clone(),
                shared: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{source_networks, source_storages};
    use crds::ProviderType;
    use inventory_client::{MockInventoryClient, NicProfile, OpenstackAddress, OpenstackVm, OvirtDisk, OvirtDiskAttachment, OvirtNic, OvirtVm};

    #[test]
    fn test_fuzzy_network() {
        let networks = vec![
            Network { id: "n1".into(), name: "Public".into(), namespace: None },
            Network { id: "n2".into(), name: "private-net".into(), namespace: None },
        ];
        assert_eq!(fuzzy_network("Public", &networks).map(|n| n.id.as_str()), Some("n1"));
        assert_eq!(fuzzy_network("public", &networks).map(|n| n.id.as_str()), Some("n1"));
        assert_eq!(fuzzy_network("private", &networks).map(|n| n.id.as_str()), Some("n2"));
        assert!(fuzzy_network("dmz", &networks).is_none());
    }

    #[test]
    fn test_multus_name() {
        assert_eq!(multus_name("ns1/vm-net-a"), "vm-net-a");
        assert_eq!(multus_name("vm-net-a"), "vm-net-a");
    }

    #[tokio::test]
    async fn test_ovirt_dereferences_profiles_and_disks() {
        let inventory = MockInventoryClient::new("http://inventory");
        inventory.add_network("ov", Network { id: "net-1".into(), name: "ovirtmgmt".into(), namespace: None });
        inventory.add_nic_profile("ov", NicProfile { id: "p1".into(), name: "mgmt".into(), network: "net-1".into() });
        inventory.add_ovirt_disk("ov", OvirtDisk { id: "d1".into(), storage_domain: "sd-1".into(), provisioned_size: 10, shared: false });
        let vm = SourceVm::OVirt(OvirtVm {
            id: "vm-1".into(),
            name: "db".into(),
            nics: vec![
                OvirtNic { id: "nic-1".into(), mac: "00:1a".into(), profile: "p1".into() },
                OvirtNic { id: "nic-2".into(), mac: "00:1b".into(), profile: String::new() },
            ],
            disk_attachments: vec![OvirtDiskAttachment { id: "a1".into(), disk: "d1".into(), interface: "virtio".into() }],
            ..Default::default()
        });
        let ctx = SourceContext { inventory: &inventory, provider_type: ProviderType::OVirt, provider_uid: "ov" };

        let networks = source_networks(&ctx, std::slice::from_ref(&vm)).await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].source, SourceRef::by_id("net-1"));
        assert_eq!(networks[0].name, "ovirtmgmt");

        let storages = source_storages(&ctx, &[vm]).await.unwrap();
        assert_eq!(storages, vec![SourceStorage { source: SourceRef::by_id("sd-1"), name: String::new() }]);
    }

    #[tokio::test]
    async fn test_openstack_networks_sorted_and_unique() {
        let inventory = MockInventoryClient::new("http://inventory");
        inventory.add_network("os", Network { id: "b".into(), name: "private".into(), namespace: None });
        inventory.add_network("os", Network { id: "a".into(), name: "public".into(), namespace: None });
        let address = |mac: &str| OpenstackAddress { addr: "10.0.0.1".into(), mac: mac.into() };
        let vm = |id: &str| {
            SourceVm::OpenStack(OpenstackVm {
                id: id.into(),
                name: id.into(),
                addresses: BTreeMap::from([
                    ("private".to_string(), vec![address("fa:01"), address("fa:01")]),
                    ("Public".to_string(), vec![address("fa:02")]),
                ]),
                ..Default::default()
            })
        };
        let ctx = SourceContext { inventory: &inventory, provider_type: ProviderType::OpenStack, provider_uid: "os" };
        let family = crate::mapping::source_family(ProviderType::OpenStack);
        assert_eq!(family.nics(&ctx, &vm("s1")).await.unwrap().len(), 2);

        let networks = source_networks(&ctx, &[vm("s1"), vm("s2")]).await.unwrap();
        let ids: Vec<&str> = networks.iter().map(|n| n.source.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
