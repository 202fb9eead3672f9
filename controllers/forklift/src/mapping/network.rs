//! Network pair synthesis.
//!
//! Rules, in order:
//! * the KubeVirt pod network maps to the pod network;
//! * KubeVirt to KubeVirt, when every source network has a destination definition of the
//!   same name and there are at least as many definitions as sources, map 1:1 by name;
//! * otherwise the first source goes to the default destination and every other source is
//!   ignored.
//!
//! The pod network is handed out at most once.

use super::SourceNetwork;
use crds::{NetworkDestination, NetworkPair, NetworkType};
use inventory_client::NetworkAttachmentDefinition;
use std::collections::BTreeSet;

/// Destination of the first source network when no 1:1 mapping applies.
///
/// `None` and `"default"` select the pod network; `"ns/name"` and `"name"` select a multus
/// network, a bare name resolving in `target_namespace`.
pub fn default_destination(default_network: Option<&str>, target_namespace: &str) -> NetworkDestination {
    match default_network.map(str::trim).filter(|d| !d.is_empty()) {
        None | Some("default") => NetworkDestination::pod(),
        Some(reference) => match reference.split_once('/') {
            Some((namespace, name)) => NetworkDestination::multus(Some(namespace.to_string()), name),
            None => NetworkDestination::multus(Some(target_namespace.to_string()), reference),
        },
    }
}

fn same_name_applies(sources: &[&SourceNetwork], targets: &[NetworkAttachmentDefinition]) -> bool {
    if sources.is_empty() || targets.len() < sources.len() {
        return false;
    }
    let available: BTreeSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    let wanted: BTreeSet<&str> = sources.iter().map(|s| s.name.as_str()).collect();
    // two sources with one name would collide on a single target
    wanted.len() == sources.len() && wanted.iter().all(|name| available.contains(name))
}

/// Build network pairs for the distinct, sorted `sources` of a plan
pub fn resolve(
    sources: &[SourceNetwork],
    targets: &[NetworkAttachmentDefinition],
    default_network: Option<&str>,
    target_namespace: &str,
    kubevirt_to_kubevirt: bool,
) -> Vec<NetworkPair> {
    let mut pod_used = false;
    let mut pairs = Vec::with_capacity(sources.len());

    for source in sources.iter().filter(|s| s.pod) {
        let destination = if pod_used { NetworkDestination::ignored() } else { NetworkDestination::pod() };
        pod_used = true;
        pairs.push(NetworkPair { source: source.source.clone(), destination });
    }

    let others: Vec<&SourceNetwork> = sources.iter().filter(|s| !s.pod).collect();
    if kubevirt_to_kubevirt && same_name_applies(&others, targets) {
        pairs.extend(others.into_iter().map(|s| NetworkPair {
            source: s.source.clone(),
            destination: NetworkDestination::multus(None, s.name.clone()),
        }));
        return pairs;
    }

    let mut first = true;
    for source in others {
        let mut destination = if first {
            default_destination(default_network, target_namespace)
        } else {
            NetworkDestination::ignored()
        };
        if destination.type_ == NetworkType::Pod {
            if pod_used {
                destination = NetworkDestination::ignored();
            }
            pod_used = true;
        }
        first = false;
        pairs.push(NetworkPair { source: source.source.clone(), destination });
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::SourceRef;

    fn multus_source(name: &str) -> SourceNetwork {
        SourceNetwork { source: SourceRef::by_name(format!("src/{}", name)), name: name.to_string(), pod: false }
    }

    fn nad(name: &str) -> NetworkAttachmentDefinition {
        NetworkAttachmentDefinition { name: name.to_string(), namespace: "target".to_string() }
    }

    #[test]
    fn test_same_name_shortcut() {
        let sources = vec![multus_source("vm-net-a"), multus_source("vm-net-b")];
        let targets = vec![nad("vm-net-a"), nad("vm-net-b"), nad("extra")];
        let pairs = resolve(&sources, &targets, None, "target", true);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].destination, NetworkDestination::multus(None, "vm-net-a"));
        assert_eq!(pairs[1].destination, NetworkDestination::multus(None, "vm-net-b"));
        assert_eq!(pairs[0].destination.to_string(), "multus(./vm-net-a)");
        assert_eq!(pairs[0].source, SourceRef::by_name("src/vm-net-a"));
    }

    #[test]
    fn test_same_name_needs_every_source_and_kubevirt() {
        let sources = vec![multus_source("vm-net-a"), multus_source("vm-net-b")];
        let pairs = resolve(&sources, &[nad("vm-net-a"), nad("other")], None, "target", true);
        assert_eq!(pairs[0].destination, NetworkDestination::pod());
        assert_eq!(pairs[1].destination, NetworkDestination::ignored());

        let targets = vec![nad("vm-net-a"), nad("vm-net-b")];
        let pairs = resolve(&sources, &targets, None, "target", false);
        assert_eq!(pairs[0].destination, NetworkDestination::pod());
    }

    #[test]
    fn test_default_path() {
        let sources = vec![
            SourceNetwork { source: SourceRef::by_name("lab"), name: "lab".into(), pod: false },
            SourceNetwork { source: SourceRef::by_name("dmz"), name: "dmz".into(), pod: false },
        ];
        let pairs = resolve(&sources, &[], Some("ns1/prod"), "target", false);
        assert_eq!(pairs[0].source, SourceRef::by_name("lab"));
        assert_eq!(pairs[0].destination, NetworkDestination::multus(Some("ns1".into()), "prod"));
        assert_eq!(pairs[1].source, SourceRef::by_name("dmz"));
        assert_eq!(pairs[1].destination, NetworkDestination::ignored());
    }

    #[test]
    fn test_pod_network_used_once() {
        let sources = vec![
            SourceNetwork { source: SourceRef::by_name("pod"), name: "pod".into(), pod: true },
            multus_source("a"),
        ];
        let pairs = resolve(&sources, &[], None, "target", true);
        assert_eq!(pairs[0].destination, NetworkDestination::pod());
        assert_eq!(pairs[1].destination, NetworkDestination::ignored());
    }

    #[test]
    fn test_default_destination() {
        assert_eq!(default_destination(None, "t"), NetworkDestination::pod());
        assert_eq!(default_destination(Some("default"), "t"), NetworkDestination::pod());
        assert_eq!(default_destination(Some("prod"), "t"), NetworkDestination::multus(Some("t".into()), "prod"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let sources = vec![multus_source("a"), multus_source("b")];
        let first = serde_json::to_string(&resolve(&sources, &[], Some("x/y"), "t", false)).unwrap();
        let second = serde_json::to_string(&resolve(&sources, &[], Some("x/y"), "t", false)).unwrap();
        assert_eq!(first, second);
    }
}
