//! Inline network and storage pair expressions of a Plan.
//!
//! ```text
//! networkPairs: "VM Network:default,dmz:ignored,backend:prod/backend-nad"
//! storagePairs: "datastore1:standard;volumeMode=Block;accessMode=ReadWriteOnce"
//! ```
//!
//! Parsing then formatting a canonical expression yields the same string. Errors quote the
//! offending token.

use crate::error::ControllerError;
use crds::{AccessMode, NetworkDestination, NetworkPair, NetworkType, SourceRef, StorageDestination, StoragePair, VolumeMode};
use std::collections::HashSet;

/// A parsed network target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkTarget {
    /// The pod network ("default")
    Default,
    /// Not attached
    Ignored,
    /// A network attachment definition
    Multus { namespace: String, name: String },
}

/// One "source:target" network token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineNetworkPair {
    /// Source network name or id
    pub source: String,
    /// Target
    pub target: NetworkTarget,
}

/// One "source:class[;key=value]*" storage token
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InlineStoragePair {
    /// Source storage name or id
    pub source: String,
    /// Storage class
    pub storage_class: String,
    /// volumeMode option
    pub volume_mode: Option<VolumeMode>,
    /// accessMode option
    pub access_mode: Option<AccessMode>,
    /// offloadPlugin option
    pub offload_plugin: Option<String>,
    /// offloadSecret option
    pub offload_secret: Option<String>,
    /// offloadVendor option
    pub offload_vendor: Option<String>,
}

fn invalid(token: &str, why: &str) -> ControllerError {
    ControllerError::Validation(format!("invalid pair '{}': {}", token, why))
}

fn tokens(expr: &str) -> impl Iterator<Item = &str> {
    expr.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn split_pair<'a>(token: &'a str) -> Result<(&'a str, &'a str), ControllerError> {
    let (source, target) = token
        .rsplit_once(':')
        .ok_or_else(|| invalid(token, "expected 'source:target'"))?;
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() {
        return Err(invalid(token, "empty source"));
    }
    if target.is_empty() {
        return Err(invalid(token, "empty target"));
    }
    Ok((source, target))
}

/// Parse a network pair expression; name-only targets resolve to `plan_namespace`
pub fn parse_network_pairs(expr: &str, plan_namespace: &str) -> Result<Vec<InlineNetworkPair>, ControllerError> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for token in tokens(expr) {
        let (source, target) = split_pair(token)?;
        if !seen.insert(source.to_string()) {
            return Err(invalid(token, "duplicate source"));
        }
        let target = match target {
            "default" => NetworkTarget::Default,
            "ignored" => NetworkTarget::Ignored,
            other => {
                let (namespace, name) = match other.split_once('/') {
                    Some((ns, name)) => (ns.trim(), name.trim()),
                    None => (plan_namespace, other),
                };
                if namespace.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid(token, "target must be default, ignored, name or namespace/name"));
                }
                NetworkTarget::Multus {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            }
        };
        pairs.push(InlineNetworkPair {
            source: source.to_string(),
            target,
        });
    }
    Ok(pairs)
}

/// Canonical form of network pairs
pub fn format_network_pairs(pairs: &[InlineNetworkPair]) -> String {
    pairs
        .iter()
        .map(|p| {
            let target = match &p.target {
                NetworkTarget::Default => "default".to_string(),
                NetworkTarget::Ignored => "ignored".to_string(),
                NetworkTarget::Multus { namespace, name } => format!("{}/{}", namespace, name),
            };
            format!("{}:{}", p.source, target)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_volume_mode(token: &str, value: &str) -> Result<VolumeMode, ControllerError> {
    match value {
        "Block" => Ok(VolumeMode::Block),
        "Filesystem" => Ok(VolumeMode::Filesystem),
        _ => Err(invalid(token, "volumeMode must be Block or Filesystem")),
    }
}

fn parse_access_mode(token: &str, value: &str) -> Result<AccessMode, ControllerError> {
    match value {
        "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
        "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
        "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
        _ => Err(invalid(token, "accessMode must be ReadWriteOnce, ReadWriteMany or ReadOnlyMany")),
    }
}

/// Parse a storage pair expression
pub fn parse_storage_pairs(expr: &str) -> Result<Vec<InlineStoragePair>, ControllerError> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for token in tokens(expr) {
        let (pair, options) = match token.split_once(';') {
            Some((pair, options)) => (pair, Some(options)),
            None => (token, None),
        };
        let (source, class) = split_pair(pair).map_err(|_| invalid(token, "expected 'source:storageClass'"))?;
        if !seen.insert(source.to_string()) {
            return Err(invalid(token, "duplicate source"));
        }
        let mut parsed = InlineStoragePair {
            source: source.to_string(),
            storage_class: class.to_string(),
            ..Default::default()
        };
        for option in options.into_iter().flat_map(|o| o.split(';')) {
            let (key, value) = option
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| invalid(token, "options must be key=value"))?;
            if value.is_empty() {
                return Err(invalid(token, "empty option value"));
            }
            match key {
                "volumeMode" => parsed.volume_mode = Some(parse_volume_mode(token, value)?),
                "accessMode" => parsed.access_mode = Some(parse_access_mode(token, value)?),
                "offloadPlugin" => parsed.offload_plugin = Some(value.to_string()),
                "offloadSecret" => parsed.offload_secret = Some(value.to_string()),
                "offloadVendor" => parsed.offload_vendor = Some(value.to_string()),
                _ => return Err(invalid(token, &format!("unknown option '{}'", key))),
            }
        }
        pairs.push(parsed);
    }
    Ok(pairs)
}

/// Canonical form of storage pairs
pub fn format_storage_pairs(pairs: &[InlineStoragePair]) -> String {
    pairs
        .iter()
        .map(|p| {
            let mut token = format!("{}:{}", p.source, p.storage_class);
            if let Some(mode) = p.volume_mode {
                token.push_str(&format!(";volumeMode={}", mode.as_str()));
            }
            if let Some(mode) = p.access_mode {
                token.push_str(&format!(";accessMode={}", mode.as_str()));
            }
            for (key, value) in [
                ("offloadPlugin", &p.offload_plugin),
                ("offloadSecret", &p.offload_secret),
                ("offloadVendor", &p.offload_vendor),
            ] {
                if let Some(value) = value {
                    token.push_str(&format!(";{}={}", key, value));
                }
            }
            token
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl From<&InlineNetworkPair> for NetworkPair {
    fn from(pair: &InlineNetworkPair) -> Self {
        let destination = match &pair.target {
            NetworkTarget::Default => NetworkDestination::pod(),
            NetworkTarget::Ignored => NetworkDestination::ignored(),
            NetworkTarget::Multus { namespace, name } => NetworkDestination::multus(Some(namespace.clone()), name),
        };
        NetworkPair {
            source: SourceRef::by_name(&pair.source),
            destination,
        }
    }
}

impl From<&InlineStoragePair> for StoragePair {
    fn from(pair: &InlineStoragePair) -> Self {
        StoragePair {
            source: SourceRef::by_name(&pair.source),
            destination: StorageDestination {
                storage_class: pair.storage_class.clone(),
                volume_mode: pair.volume_mode,
                access_mode: pair.access_mode,
                offload_plugin: pair.offload_plugin.clone(),
                offload_secret: pair.offload_secret.clone(),
                offload_vendor: pair.offload_vendor.clone(),
            },
        }
    }
}

/// Network pairs of an existing map, in inline form (used to detect changed expressions)
pub fn network_pairs_of(map: &[NetworkPair]) -> Vec<InlineNetworkPair> {
    map.iter()
        .map(|p| InlineNetworkPair {
            source: p.source.key().to_string(),
            target: match p.destination.type_ {
                NetworkType::Pod => NetworkTarget::Default,
                NetworkType::Ignored => NetworkTarget::Ignored,
                NetworkType::Multus => NetworkTarget::Multus {
                    namespace: p.destination.namespace.clone().unwrap_or_default(),
                    name: p.destination.name.clone().unwrap_or_default(),
                },
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_pairs() {
        let pairs = parse_network_pairs("VM Network:default, dmz:ignored,backend:prod/backend-nad,db:db-nad", "plans").unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].source, "VM Network");
        assert_eq!(pairs[0].target, NetworkTarget::Default);
        assert_eq!(pairs[1].target, NetworkTarget::Ignored);
        assert_eq!(
            pairs[2].target,
            NetworkTarget::Multus {
                namespace: "prod".to_string(),
                name: "backend-nad".to_string()
            }
        );
        // Name-only targets resolve to the plan namespace
        assert_eq!(
            pairs[3].target,
            NetworkTarget::Multus {
                namespace: "plans".to_string(),
                name: "db-nad".to_string()
            }
        );
    }

    #[test]
    fn test_network_round_trip() {
        let canonical = "VM Network:default,dmz:ignored,backend:prod/backend-nad";
        let pairs = parse_network_pairs(canonical, "plans").unwrap();
        assert_eq!(format_network_pairs(&pairs), canonical);

        // Non-canonical input converges after one pass
        let pairs = parse_network_pairs(" a:default ,,b:nad ", "ns1").unwrap();
        let once = format_network_pairs(&pairs);
        assert_eq!(once, "a:default,b:ns1/nad");
        assert_eq!(format_network_pairs(&parse_network_pairs(&once, "other").unwrap()), once);
    }

    #[test]
    fn test_network_errors_quote_token() {
        let err = parse_network_pairs("a:default,broken", "ns").unwrap_err();
        assert!(err.to_string().contains("'broken'"));

        let err = parse_network_pairs("a:x/y/z", "ns").unwrap_err();
        assert!(err.to_string().contains("'a:x/y/z'"));

        assert!(parse_network_pairs(":default", "ns").is_err());
        assert!(parse_network_pairs("a:", "ns").is_err());
        assert!(parse_network_pairs("a:default,a:ignored", "ns").is_err());
    }

    #[test]
    fn test_storage_pairs() {
        let pairs = parse_storage_pairs("ds1:standard;volumeMode=Block;accessMode=ReadWriteOnce,ds2:fast").unwrap();
        assert_eq!(pairs[0].storage_class, "standard");
        assert_eq!(pairs[0].volume_mode, Some(VolumeMode::Block));
        assert_eq!(pairs[0].access_mode, Some(AccessMode::ReadWriteOnce));
        assert_eq!(pairs[1].volume_mode, None);

        let pair = StoragePair::from(&pairs[0]);
        assert_eq!(pair.source, SourceRef::by_name("ds1"));
        assert!(!pair.destination.is_offload());
    }

    #[test]
    fn test_storage_round_trip_orders_keys() {
        let pairs =
            parse_storage_pairs("ds1:gold;offloadVendor=vantara;accessMode=ReadWriteMany;volumeMode=Filesystem").unwrap();
        let canonical = format_storage_pairs(&pairs);
        assert_eq!(canonical, "ds1:gold;volumeMode=Filesystem;accessMode=ReadWriteMany;offloadVendor=vantara");
        assert_eq!(format_storage_pairs(&parse_storage_pairs(&canonical).unwrap()), canonical);
        assert!(StoragePair::from(&pairs[0]).destination.is_offload());
    }

    #[test]
    fn test_storage_errors_quote_token() {
        let err = parse_storage_pairs("ds1:gold;volumeMode=Raw").unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(err.to_string().contains("'ds1:gold;volumeMode=Raw'"));

        assert!(parse_storage_pairs("ds1:gold;color=blue").is_err());
        assert!(parse_storage_pairs("ds1:gold;volumeMode").is_err());
        assert!(parse_storage_pairs("ds1").is_err());
    }

    #[test]
    fn test_inline_pairs_to_map_entries() {
        let pairs = parse_network_pairs("a:default,b:ns/nad", "ns").unwrap();
        let map: Vec<NetworkPair> = pairs.iter().map(NetworkPair::from).collect();
        assert_eq!(map[0].destination, NetworkDestination::pod());
        assert_eq!(map[1].destination, NetworkDestination::multus(Some("ns".to_string()), "nad"));
        assert_eq!(network_pairs_of(&map), pairs);
    }
}
