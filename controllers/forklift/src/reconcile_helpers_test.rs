//! Unit tests for reconcile_helpers module

#[cfg(test)]
mod tests {
    use super::super::*;
    use crds::{Plan, PlanSpec, PlanStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn plan() -> Plan {
        Plan {
            metadata: ObjectMeta {
                name: Some("move-web".to_string()),
                namespace: Some("apps".to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: PlanSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&plan()), "Plan/apps/move-web");
    }

    #[test]
    fn test_owner_reference() {
        let owner = owner_reference(&plan()).unwrap();
        assert_eq!(owner.kind, "Plan");
        assert_eq!(owner.api_version, "forklift.konveyor.io/v1beta1");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, None);

        let mut anonymous = plan();
        anonymous.metadata.uid = None;
        assert!(owner_reference(&anonymous).is_none());
    }

    #[test]
    fn test_status_patch_carries_resource_version() {
        let status = PlanStatus::default();
        let patch = status_patch(&status, Some("42")).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert!(patch["status"].is_object());

        let patch = status_patch(&status, None).unwrap();
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn test_status_needs_update() {
        let status = PlanStatus::default();
        assert!(status_needs_update(None, &status));
        assert!(!status_needs_update(Some(&status), &status));
        let changed = PlanStatus {
            observed_generation: Some(2),
            ..Default::default()
        };
        assert!(status_needs_update(Some(&status), &changed));
    }

    #[test]
    fn test_label_selector_is_sorted() {
        let labels = BTreeMap::from([
            ("vmID".to_string(), "vm-1".to_string()),
            ("migration".to_string(), "m-1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "migration=m-1,vmID=vm-1");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_merge_labels() {
        let base = BTreeMap::from([("app".to_string(), "forklift".to_string())]);
        let extra = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        let merged = merge_labels(&base, &extra);
        assert_eq!(merged.get("app").map(String::as_str), Some("web"));
        assert_eq!(merged.len(), 2);
    }
}
