//! Storage pair synthesis.
//!
//! Every source storage maps to the destination's default class, except EBS volume types,
//! which map to a matching EBS class with the volume and access mode of their media.

use super::SourceStorage;
use crds::{AccessMode, StorageDestination, StoragePair, VolumeMode};
use inventory_client::StorageClass;

/// KubeVirt default class annotation
pub const DEFAULT_VIRT_CLASS: &str = "storageclass.kubevirt.io/is-default-virt-class";
/// Kubernetes default class annotation
pub const DEFAULT_CLASS: &str = "storageclass.kubernetes.io/is-default-class";

const EBS_PROVISIONERS: [&str; 2] = ["ebs.csi.aws.com", "kubernetes.io/aws-ebs"];
const EBS_TYPE_TOKENS: [&str; 6] = ["gp2", "gp3", "io1", "io2", "st1", "sc1"];

fn annotated(class: &StorageClass, annotation: &str) -> bool {
    class.annotations.get(annotation).is_some_and(|v| v == "true")
}

/// Default destination class: KubeVirt default, Kubernetes default, a "virtualization"
/// class, then the first one listed
pub fn default_class(classes: &[StorageClass]) -> Option<&StorageClass> {
    classes
        .iter()
        .find(|c| annotated(c, DEFAULT_VIRT_CLASS))
        .or_else(|| classes.iter().find(|c| annotated(c, DEFAULT_CLASS)))
        .or_else(|| classes.iter().find(|c| c.name.contains("virtualization")))
        .or_else(|| classes.first())
}

/// Media of an EBS volume type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbsMedia {
    /// gp2, gp3, io1, io2
    Ssd,
    /// st1, sc1, standard
    Hdd,
}

impl EbsMedia {
    /// Classify a volume type; unknown types have no media
    pub fn of(volume_type: &str) -> Option<Self> {
        match volume_type {
            "gp2" | "gp3" | "io1" | "io2" => Some(Self::Ssd),
            "st1" | "sc1" | "standard" => Some(Self::Hdd),
            _ => None,
        }
    }

    /// Volume mode used for claims of this media
    pub fn volume_mode(&self) -> VolumeMode {
        match self {
            Self::Ssd => VolumeMode::Block,
            Self::Hdd => VolumeMode::Filesystem,
        }
    }
}

/// True when a class provisions EBS volumes.
///
/// A class counts as EBS by provisioner, by "ebs" in its name, or by a volume type token
/// in its name even when "ebs" is absent.
pub fn is_ebs_class(class: &StorageClass) -> bool {
    let name = class.name.to_lowercase();
    EBS_PROVISIONERS.contains(&class.provisioner.as_str())
        || name.contains("ebs")
        || EBS_TYPE_TOKENS.iter().any(|t| name.contains(t))
}

/// EBS class for a volume type: exact name, `<type>-` prefix, default EBS class, first EBS
/// class
pub fn select_ebs_class<'a>(volume_type: &str, classes: &'a [StorageClass]) -> Option<&'a StorageClass> {
    let ebs: Vec<&StorageClass> = classes.iter().filter(|c| is_ebs_class(c)).collect();
    let prefix = format!("{}-", volume_type);
    ebs.iter()
        .find(|c| c.name == volume_type)
        .or_else(|| ebs.iter().find(|c| c.name.starts_with(&prefix)))
        .or_else(|| ebs.iter().find(|c| annotated(c, DEFAULT_VIRT_CLASS) || annotated(c, DEFAULT_CLASS)))
        .or_else(|| ebs.iter().find(|c| c.name.contains("standard") || c.name.contains("default")))
        .or_else(|| ebs.first())
        .copied()
}

/// Build storage pairs for the distinct, sorted `sources` of a plan. Empty when the
/// destination has no storage class at all.
pub fn resolve(sources: &[SourceStorage], classes: &[StorageClass], ebs_source: bool) -> Vec<StoragePair> {
    let Some(fallback) = default_class(classes) else {
        return Vec::new();
    };
    sources
        .iter()
        .map(|source| {
            let destination = if ebs_source {
                let class = select_ebs_class(&source.name, classes).unwrap_or(fallback);
                let media = EbsMedia::of(&source.name);
                StorageDestination {
                    storage_class: class.name.clone(),
                    volume_mode: media.map(|m| m.volume_mode()),
                    access_mode: media.map(|_| AccessMode::ReadWriteOnce),
                    ..Default::default()
                }
            } else {
                StorageDestination { storage_class: fallback.name.clone(), ..Default::default() }
            };
            StoragePair { source: source.source.clone(), destination }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::SourceRef;
    use std::collections::BTreeMap;

    fn class(name: &str) -> StorageClass {
        StorageClass { name: name.to_string(), ..Default::default() }
    }

    fn annotated_class(name: &str, annotation: &str) -> StorageClass {
        StorageClass {
            name: name.to_string(),
            annotations: BTreeMap::from([(annotation.to_string(), "true".to_string())]),
            ..Default::default()
        }
    }

    fn volume_type(name: &str) -> SourceStorage {
        SourceStorage { source: SourceRef::by_name(name), name: name.to_string() }
    }

    #[test]
    fn test_ebs_scenario() {
        let classes = vec![class("gp3-csi"), class("standard-ebs")];
        let pairs = resolve(&[volume_type("gp3"), volume_type("st1")], &classes, true);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].source, SourceRef::by_name("gp3"));
        assert_eq!(pairs[0].destination.storage_class, "gp3-csi");
        assert_eq!(pairs[0].destination.volume_mode, Some(VolumeMode::Block));
        assert_eq!(pairs[0].destination.access_mode, Some(AccessMode::ReadWriteOnce));
        assert_eq!(pairs[1].destination.storage_class, "standard-ebs");
        assert_eq!(pairs[1].destination.volume_mode, Some(VolumeMode::Filesystem));
        assert_eq!(pairs[1].destination.access_mode, Some(AccessMode::ReadWriteOnce));
    }

    #[test]
    fn test_ebs_detection() {
        assert!(is_ebs_class(&class("gp3-csi")));
        assert!(is_ebs_class(&class("standard-ebs")));
        assert!(is_ebs_class(&StorageClass { name: "fast".into(), provisioner: "ebs.csi.aws.com".into(), ..Default::default() }));
        assert!(!is_ebs_class(&class("ocs-storagecluster-ceph-rbd")));
    }

    #[test]
    fn test_ebs_selection_order() {
        let classes = vec![class("io2-fast"), annotated_class("gp2-default-ish", DEFAULT_CLASS), class("io1")];
        assert_eq!(select_ebs_class("io1", &classes).map(|c| c.name.as_str()), Some("io1"));
        assert_eq!(select_ebs_class("io2", &classes).map(|c| c.name.as_str()), Some("io2-fast"));
        assert_eq!(select_ebs_class("sc1", &classes).map(|c| c.name.as_str()), Some("gp2-default-ish"));
        assert_eq!(select_ebs_class("sc1", &[class("nfs")]), None);
    }

    #[test]
    fn test_default_class_priority() {
        let classes = vec![
            class("first"),
            class("openshift-virtualization"),
            annotated_class("k8s-default", DEFAULT_CLASS),
            annotated_class("virt-default", DEFAULT_VIRT_CLASS),
        ];
        assert_eq!(default_class(&classes).map(|c| c.name.as_str()), Some("virt-default"));
        assert_eq!(default_class(&classes[..3]).map(|c| c.name.as_str()), Some("k8s-default"));
        assert_eq!(default_class(&classes[..2]).map(|c| c.name.as_str()), Some("openshift-virtualization"));
        assert_eq!(default_class(&classes[..1]).map(|c| c.name.as_str()), Some("first"));
        assert!(default_class(&[]).is_none());
    }

    #[test]
    fn test_non_ebs_sources_use_default() {
        let classes = vec![class("a"), annotated_class("b", DEFAULT_CLASS)];
        let sources = vec![
            SourceStorage { source: SourceRef::by_id("ds-1"), name: "datastore1".into() },
            SourceStorage { source: SourceRef::by_id("ds-2"), name: "datastore2".into() },
        ];
        let pairs = resolve(&sources, &classes, false);
        assert!(pairs.iter().all(|p| p.destination.storage_class == "b" && p.destination.volume_mode.is_none()));
        assert!(resolve(&sources, &[], false).is_empty());
    }
}
