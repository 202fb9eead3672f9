//! NetworkMap and StorageMap reconciliation.
//!
//! A map is Ready when both providers are Ready and every destination exists on the
//! destination provider.

use crate::error::ControllerError;
use crate::mapping::{InventoryTargets, TargetNetworkFetcher, TargetStorageFetcher};
use crate::reconcile_helpers::object_key;
use crate::reconciler::Reconciler;
use chrono::Utc;
use crds::{
    merge_conditions, Condition, MapStatus, NetworkMap, NetworkPair, NetworkType, Provider, ProviderPair, StorageMap,
    StoragePair,
};
use inventory_client::{NetworkAttachmentDefinition, StorageClass};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, info};

/// Condition types of mapping objects
pub mod conditions {
    /// Source provider missing or not ready
    pub const SOURCE_PROVIDER_NOT_VALID: &str = "SourceProviderNotValid";
    /// Destination provider missing or not ready
    pub const DESTINATION_PROVIDER_NOT_VALID: &str = "DestinationProviderNotValid";
    /// A destination network or storage class does not exist
    pub const DESTINATION_NOT_VALID: &str = "DestinationNotValid";
}

/// Provider conditions shared by both map kinds
pub fn provider_conditions(source: Option<&Provider>, destination: Option<&Provider>, pair: &ProviderPair) -> Vec<Condition> {
    let mut out = Vec::new();
    match source {
        None => out.push(Condition::critical(
            conditions::SOURCE_PROVIDER_NOT_VALID,
            "NotFound",
            format!("Source provider '{}' not found.", pair.source.name),
        )),
        Some(p) if !p.is_ready() => out.push(Condition::critical(
            conditions::SOURCE_PROVIDER_NOT_VALID,
            "NotReady",
            format!("Source provider '{}' is not ready.", pair.source.name),
        )),
        Some(_) => {}
    }
    match destination {
        None => out.push(Condition::critical(
            conditions::DESTINATION_PROVIDER_NOT_VALID,
            "NotFound",
            format!("Destination provider '{}' not found.", pair.destination.name),
        )),
        Some(p) if !p.is_ready() => out.push(Condition::critical(
            conditions::DESTINATION_PROVIDER_NOT_VALID,
            "NotReady",
            format!("Destination provider '{}' is not ready.", pair.destination.name),
        )),
        Some(_) => {}
    }
    out
}

/// Multus destinations without a matching network attachment definition
pub fn missing_networks(pairs: &[NetworkPair], nads: &[NetworkAttachmentDefinition]) -> Vec<String> {
    pairs
        .iter()
        .filter(|p| p.destination.type_ == NetworkType::Multus)
        .filter_map(|p| {
            let name = p.destination.name.as_deref().unwrap_or_default();
            let found = nads.iter().any(|nad| {
                nad.name == name && p.destination.namespace.as_deref().is_none_or(|ns| ns == nad.namespace)
            });
            (!found).then(|| p.destination.to_string())
        })
        .collect()
}

/// Storage classes named by pairs that do not exist
pub fn missing_classes(pairs: &[StoragePair], classes: &[StorageClass]) -> Vec<String> {
    let mut missing: Vec<String> = pairs
        .iter()
        .map(|p| p.destination.storage_class.clone())
        .filter(|name| !classes.iter().any(|c| &c.name == name))
        .collect();
    missing.dedup();
    missing
}

/// Full condition set of a map; `missing` lists destinations that do not exist
pub fn map_conditions(mut conditions: Vec<Condition>, missing: &[String]) -> Vec<Condition> {
    if !missing.is_empty() {
        conditions.push(Condition::critical(
            self::conditions::DESTINATION_NOT_VALID,
            "NotFound",
            format!("Destinations not found: {}.", missing.join(", ")),
        ));
    }
    if conditions.iter().all(|c| !c.is_blocker()) {
        conditions.push(Condition::ready("The map is ready."));
    }
    conditions
}

impl Reconciler {
    async fn map_providers(&self, pair: &ProviderPair, namespace: &str) -> Result<(Option<Provider>, Option<Provider>), ControllerError> {
        let source = self.lookup::<Provider>(&pair.source, namespace).await?;
        let destination = self.lookup::<Provider>(&pair.destination, namespace).await?;
        Ok((source, destination))
    }

    /// Reconciles a NetworkMap.
    pub async fn reconcile_network_map(&self, map: &NetworkMap) -> Result<Action, ControllerError> {
        let key = object_key(map);
        info!("Reconciling {}", key);
        let namespace = map.namespace().unwrap_or_default();
        let (source, destination) = self.map_providers(&map.spec.provider, &namespace).await?;

        let mut missing = Vec::new();
        if let Some(dest) = destination.as_ref().filter(|d| d.is_ready()) {
            let uid = dest.uid().unwrap_or_default();
            let targets = InventoryTargets::new(self.inventory.as_ref(), &uid);
            let nads = self.call("list network attachment definitions", targets.network_attachments(None)).await?;
            missing = missing_networks(&map.spec.map, &nads);
        }
        let desired = map_conditions(provider_conditions(source.as_ref(), destination.as_ref(), &map.spec.provider), &missing);
        self.write_map_status(map, map.status.as_ref(), desired).await?;
        self.reconciled(&key);
        Ok(Action::await_change())
    }

    /// Reconciles a StorageMap.
    pub async fn reconcile_storage_map(&self, map: &StorageMap) -> Result<Action, ControllerError> {
        let key = object_key(map);
        info!("Reconciling {}", key);
        let namespace = map.namespace().unwrap_or_default();
        let (source, destination) = self.map_providers(&map.spec.provider, &namespace).await?;

        let mut missing = Vec::new();
        if let Some(dest) = destination.as_ref().filter(|d| d.is_ready()) {
            let uid = dest.uid().unwrap_or_default();
            let targets = InventoryTargets::new(self.inventory.as_ref(), &uid);
            let classes = self.call("list storage classes", targets.storage_classes()).await?;
            missing = missing_classes(&map.spec.map, &classes);
        }
        let desired = map_conditions(provider_conditions(source.as_ref(), destination.as_ref(), &map.spec.provider), &missing);
        self.write_map_status(map, map.status.as_ref(), desired).await?;
        self.reconciled(&key);
        Ok(Action::await_change())
    }

    async fn write_map_status<K>(&self, map: &K, current: Option<&MapStatus>, desired: Vec<Condition>) -> Result<(), ControllerError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
    {
        let existing = current.map(|s| s.conditions.as_slice()).unwrap_or_default();
        let status = MapStatus {
            conditions: merge_conditions(existing, desired, &[], Utc::now()),
            observed_generation: map.meta().generation,
        };
        let outcome = self.write_status(map, current, &status).await?;
        debug!("{} status: {:?}", object_key(map), outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{find_condition, types, NetworkDestination, ProviderSpec, ProviderStatus, ResourceRef, SourceRef, StorageDestination};

    fn provider(ready: bool) -> Provider {
        let mut p = Provider::new("p", ProviderSpec {
            type_: crds::ProviderType::OpenShift,
            url: String::new(),
            secret: None,
            settings: Default::default(),
        });
        if ready {
            p.status = Some(ProviderStatus {
                conditions: vec![Condition::ready("")],
                ..Default::default()
            });
        }
        p
    }

    fn pair() -> ProviderPair {
        ProviderPair {
            source: ResourceRef::new("vmware"),
            destination: ResourceRef::new("host"),
        }
    }

    #[test]
    fn test_providers_missing_and_not_ready() {
        let conditions = provider_conditions(None, Some(&provider(false)), &pair());
        let source = find_condition(&conditions, conditions::SOURCE_PROVIDER_NOT_VALID).unwrap();
        assert_eq!(source.reason, "NotFound");
        let dest = find_condition(&conditions, conditions::DESTINATION_PROVIDER_NOT_VALID).unwrap();
        assert_eq!(dest.reason, "NotReady");
        let all = map_conditions(conditions, &[]);
        assert!(find_condition(&all, types::READY).is_none());
    }

    #[test]
    fn test_ready_map() {
        let conditions = provider_conditions(Some(&provider(true)), Some(&provider(true)), &pair());
        let all = map_conditions(conditions, &[]);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].type_, types::READY);
    }

    #[test]
    fn test_missing_networks() {
        let nads = vec![NetworkAttachmentDefinition { name: "prod".into(), namespace: "ns1".into() }];
        let pairs = vec![
            NetworkPair { source: SourceRef::by_name("a"), destination: NetworkDestination::multus(Some("ns1".into()), "prod") },
            NetworkPair { source: SourceRef::by_name("b"), destination: NetworkDestination::multus(None, "prod") },
            NetworkPair { source: SourceRef::by_name("c"), destination: NetworkDestination::multus(Some("ns2".into()), "prod") },
            NetworkPair { source: SourceRef::by_name("d"), destination: NetworkDestination::pod() },
        ];
        assert_eq!(missing_networks(&pairs, &nads), vec!["multus(ns2/prod)".to_string()]);
    }

    #[test]
    fn test_missing_classes() {
        let classes = vec![StorageClass { name: "standard".into(), ..Default::default() }];
        let pairs = vec![
            StoragePair { source: SourceRef::by_id("ds-1"), destination: StorageDestination { storage_class: "standard".into(), ..Default::default() } },
            StoragePair { source: SourceRef::by_id("ds-2"), destination: StorageDestination { storage_class: "fast".into(), ..Default::default() } },
        ];
        assert_eq!(missing_classes(&pairs, &classes), vec!["fast".to_string()]);
        let conditions = map_conditions(Vec::new(), &missing_classes(&pairs, &classes));
        assert!(find_condition(&conditions, conditions::DESTINATION_NOT_VALID).is_some());
        assert!(find_condition(&conditions, types::READY).is_none());
    }
}
