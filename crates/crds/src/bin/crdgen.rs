//! Prints every Forklift CRD as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crds.yaml`

use crds::{
    Ec2VolumePopulator, Hook, Migration, NetworkMap, OVAProviderServer, OffloadPluginVolumePopulator,
    OpenstackVolumePopulator, OvirtVolumePopulator, Plan, Provider, StorageMap,
    VSphereXcopyVolumePopulator,
};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Provider::crd(),
        Plan::crd(),
        Migration::crd(),
        NetworkMap::crd(),
        StorageMap::crd(),
        Hook::crd(),
        OVAProviderServer::crd(),
        OvirtVolumePopulator::crd(),
        OpenstackVolumePopulator::crd(),
        Ec2VolumePopulator::crd(),
        VSphereXcopyVolumePopulator::crd(),
        OffloadPluginVolumePopulator::crd(),
    ];

    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
