//! Inventory data models
//!
//! The inventory service exposes one REST tree per provider family. Only the fields the
//! controllers consume are modeled; unknown fields are ignored on deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider as known to the inventory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Provider UID
    pub uid: String,
    /// Provider name
    #[serde(default)]
    pub name: String,
    /// Provider namespace
    #[serde(default)]
    pub namespace: String,
    /// Number of VMs collected so far (presence means the collector finished its first pass)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_count: Option<u64>,
}

/// A bare reference to another inventory object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    /// Identifier
    pub id: String,
}

/// A network in the source inventory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Identifier
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Namespace (network attachment definitions only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A storage (datastore, storage domain, volume type...) in the source inventory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Identifier
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
}

/// vSphere VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VSphereVm {
    /// Managed object id
    pub id: String,
    /// Name
    pub name: String,
    /// Inventory path
    #[serde(default)]
    pub path: String,
    /// BIOS UUID
    #[serde(default)]
    pub uuid: String,
    /// "poweredOn", "poweredOff", "suspended"
    #[serde(default)]
    pub power_state: String,
    /// "bios" or "efi"
    #[serde(default)]
    pub firmware: String,
    /// Number of virtual CPUs
    #[serde(default)]
    pub cpu_count: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory_mb: u64,
    /// Changed block tracking is enabled (required for warm)
    #[serde(default)]
    pub change_tracking_enabled: bool,
    /// Host managed object id
    #[serde(default)]
    pub host: String,
    /// Networks
    #[serde(default)]
    pub networks: Vec<Ref>,
    /// NICs
    #[serde(default)]
    pub nics: Vec<VSphereNic>,
    /// Disks
    #[serde(default)]
    pub disks: Vec<VSphereDisk>,
    /// Guest network configuration reported by VMware tools
    #[serde(default)]
    pub guest_networks: Vec<GuestNetwork>,
}

/// vSphere NIC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VSphereNic {
    /// MAC address
    pub mac: String,
    /// Network
    pub network: Ref,
}

/// vSphere disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDisk {
    /// Device key
    #[serde(default)]
    pub key: i32,
    /// Backing file (`[datastore] vm/disk.vmdk`)
    pub file: String,
    /// Datastore
    pub datastore: Ref,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,
    /// Shared between VMs
    #[serde(default)]
    pub shared: bool,
}

/// Guest IP configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GuestNetwork {
    /// MAC address
    pub mac: String,
    /// IP address
    pub ip: String,
    /// "manual", "dhcp", ...
    #[serde(default)]
    pub origin: String,
    /// Prefix length
    #[serde(default)]
    pub prefix_length: u32,
}

/// oVirt VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OvirtVm {
    /// Identifier
    pub id: String,
    /// Name
    pub name: String,
    /// "up", "down", ...
    #[serde(default)]
    pub status: String,
    /// Number of virtual CPUs
    #[serde(default)]
    pub cpu_cores: u32,
    /// Memory in bytes
    #[serde(default)]
    pub memory: u64,
    /// BIOS type
    #[serde(default)]
    pub bios_type: String,
    /// Custom CPU model of the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cpu_model: Option<String>,
    /// CPU model of the VM's cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_cpu_model: Option<String>,
    /// NICs
    #[serde(default)]
    pub nics: Vec<OvirtNic>,
    /// Disk attachments
    #[serde(default)]
    pub disk_attachments: Vec<OvirtDiskAttachment>,
}

/// oVirt NIC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OvirtNic {
    /// Identifier
    pub id: String,
    /// MAC address
    #[serde(default)]
    pub mac: String,
    /// vNIC profile
    pub profile: String,
}

/// oVirt disk attachment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OvirtDiskAttachment {
    /// Attachment identifier
    #[serde(default)]
    pub id: String,
    /// Disk identifier
    pub disk: String,
    /// Interface (virtio, virtio_scsi, ide, sata)
    #[serde(default)]
    pub interface: String,
}

/// oVirt vNIC profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NicProfile {
    /// Identifier
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Network identifier
    pub network: String,
}

/// oVirt disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OvirtDisk {
    /// Identifier
    pub id: String,
    /// Storage domain identifier
    pub storage_domain: String,
    /// Provisioned size in bytes
    #[serde(default)]
    pub provisioned_size: u64,
    /// Shared between VMs
    #[serde(default)]
    pub shared: bool,
}

/// OpenStack server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackVm {
    /// Identifier
    pub id: String,
    /// Name
    pub name: String,
    /// "ACTIVE", "SHUTOFF", ...
    #[serde(default)]
    pub status: String,
    /// Addresses keyed by network name
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<OpenstackAddress>>,
    /// Attached volumes
    #[serde(default)]
    pub attached_volumes: Vec<Ref>,
    /// Flavor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<OpenstackFlavor>,
}

/// OpenStack address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackAddress {
    /// IP address
    #[serde(default)]
    pub addr: String,
    /// MAC address
    #[serde(default, rename = "OS-EXT-IPS-MAC:mac_addr")]
    pub mac: String,
}

/// OpenStack flavor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackFlavor {
    /// Virtual CPUs
    #[serde(default)]
    pub vcpus: u32,
    /// Memory in MiB
    #[serde(default)]
    pub ram: u64,
}

/// OpenStack volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackVolume {
    /// Identifier
    pub id: String,
    /// Volume type name
    #[serde(default)]
    pub volume_type: String,
    /// Size in GiB
    #[serde(default)]
    pub size: u64,
    /// Bootable
    #[serde(default)]
    pub bootable: String,
}

/// EC2 instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Instance {
    /// Instance id
    pub id: String,
    /// Name tag
    #[serde(default)]
    pub name: String,
    /// "running", "stopped", ...
    #[serde(default)]
    pub state: String,
    /// Instance type
    #[serde(default)]
    pub instance_type: String,
    /// Availability zone
    #[serde(default)]
    pub availability_zone: String,
    /// Network interfaces
    #[serde(default)]
    pub network_interfaces: Vec<Ec2NetworkInterface>,
    /// Block device mappings
    #[serde(default)]
    pub block_devices: Vec<Ec2BlockDevice>,
}

/// EC2 network interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ec2NetworkInterface {
    /// Subnet
    pub subnet_id: String,
    /// MAC address
    #[serde(default)]
    pub mac: String,
}

/// EC2 block device mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ec2BlockDevice {
    /// Device name ("/dev/sda1")
    pub device_name: String,
    /// EBS volume
    pub volume_id: String,
}

/// EBS volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Volume {
    /// Volume id
    pub id: String,
    /// gp2, gp3, io1, io2, st1, sc1, standard
    pub volume_type: String,
    /// Size in GiB
    #[serde(default)]
    pub size: u64,
}

/// VM inside an OVA archive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OvaVm {
    /// Identifier
    pub id: String,
    /// Name
    pub name: String,
    /// Path of the OVA on the share
    #[serde(default)]
    pub ova_path: String,
    /// Firmware
    #[serde(default)]
    pub firmware: String,
    /// Virtual CPUs
    #[serde(default)]
    pub cpu_count: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory_mb: u64,
    /// Networks
    #[serde(default)]
    pub networks: Vec<Ref>,
    /// NICs
    #[serde(default)]
    pub nics: Vec<VSphereNic>,
    /// Disks
    #[serde(default)]
    pub disks: Vec<ImageDisk>,
}

/// Disk stored as an image file (OVA, Hyper-V)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageDisk {
    /// Identifier
    pub id: String,
    /// Image file path
    #[serde(default)]
    pub file_path: String,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,
}

/// Hyper-V VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HyperVVm {
    /// Identifier
    pub id: String,
    /// Name
    pub name: String,
    /// "On", "Off"
    #[serde(default)]
    pub power_state: String,
    /// Generation 1 (BIOS) or 2 (UEFI)
    #[serde(default)]
    pub generation: u32,
    /// Virtual CPUs
    #[serde(default)]
    pub cpu_count: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory_mb: u64,
    /// Networks
    #[serde(default)]
    pub networks: Vec<Ref>,
    /// NICs
    #[serde(default)]
    pub nics: Vec<VSphereNic>,
    /// Disks
    #[serde(default)]
    pub disks: Vec<ImageDisk>,
}

/// KubeVirt VM on a source cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenshiftVm {
    /// UID
    pub id: String,
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Printable status ("Running", "Stopped")
    #[serde(default)]
    pub status: String,
    /// Networks
    #[serde(default)]
    pub networks: Vec<OpenshiftNetwork>,
    /// Volumes backed by claims
    #[serde(default)]
    pub volumes: Vec<OpenshiftVolume>,
}

/// KubeVirt VM network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenshiftNetwork {
    /// Interface name
    pub name: String,
    /// Pod network
    #[serde(default)]
    pub pod: bool,
    /// Multus network name ("ns/name" or "name")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<String>,
    /// MAC address
    #[serde(default)]
    pub mac: String,
}

/// KubeVirt VM volume backed by a claim
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenshiftVolume {
    /// Volume name
    pub name: String,
    /// Claim name
    pub claim_name: String,
    /// Storage class of the claim
    #[serde(default)]
    pub storage_class: String,
    /// Requested size in bytes
    #[serde(default)]
    pub capacity: u64,
}

/// A source VM of any family
#[derive(Debug, Clone, PartialEq)]
pub enum SourceVm {
    /// vSphere
    VSphere(VSphereVm),
    /// oVirt
    OVirt(OvirtVm),
    /// OpenStack
    OpenStack(OpenstackVm),
    /// EC2
    Ec2(Ec2Instance),
    /// OVA
    Ova(OvaVm),
    /// Hyper-V
    HyperV(HyperVVm),
    /// KubeVirt
    OpenShift(OpenshiftVm),
}

impl SourceVm {
    /// Inventory identifier
    pub fn id(&self) -> &str {
        match self {
            Self::VSphere(vm) => &vm.id,
            Self::OVirt(vm) => &vm.id,
            Self::OpenStack(vm) => &vm.id,
            Self::Ec2(vm) => &vm.id,
            Self::Ova(vm) => &vm.id,
            Self::HyperV(vm) => &vm.id,
            Self::OpenShift(vm) => &vm.id,
        }
    }

    /// Inventory name
    pub fn name(&self) -> &str {
        match self {
            Self::VSphere(vm) => &vm.name,
            Self::OVirt(vm) => &vm.name,
            Self::OpenStack(vm) => &vm.name,
            Self::Ec2(vm) => &vm.name,
            Self::Ova(vm) => &vm.name,
            Self::HyperV(vm) => &vm.name,
            Self::OpenShift(vm) => &vm.name,
        }
    }
}

/// Storage class on the destination cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    /// Name
    pub name: String,
    /// CSI or in-tree provisioner
    #[serde(default)]
    pub provisioner: String,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Network attachment definition on the destination cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinition {
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
}
