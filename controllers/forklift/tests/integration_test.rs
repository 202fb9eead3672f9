//! Integration tests for the Forklift controller
//!
//! These tests require a cluster with the Forklift CRDs installed and the controller running.
//! Set TEST_NAMESPACE to choose where the test objects are created (default `forklift-e2e`).

use crds::{Hook, HookSpec, Provider, ProviderSpec, ProviderType};
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::time::Duration;

fn namespace() -> String {
    std::env::var("TEST_NAMESPACE").unwrap_or_else(|_| "forklift-e2e".to_string())
}

async fn client() -> Client {
    Client::try_default().await.expect("Failed to create Kubernetes client")
}

/// Poll `name` until `done` holds or a minute passes
async fn wait_for<K, F>(api: &Api<K>, name: &str, done: F) -> K
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    F: Fn(&K) -> bool,
{
    for _ in 0..60 {
        let obj = api.get(name).await.expect("Failed to get object");
        if done(&obj) {
            return obj;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("{} did not reach the expected state", name);
}

#[tokio::test]
#[ignore] // Requires a cluster running the controller
async fn test_host_provider_becomes_ready() {
    let api: Api<Provider> = Api::namespaced(client().await, &namespace());
    let provider = Provider::new("e2e-host", ProviderSpec {
        type_: ProviderType::OpenShift,
        url: String::new(),
        secret: None,
        settings: BTreeMap::new(),
    });
    api.create(&PostParams::default(), &provider).await.expect("Failed to create provider");

    let ready = wait_for(&api, "e2e-host", Provider::is_ready).await;
    assert!(ready.metadata.finalizers.unwrap_or_default().iter().any(|f| f == "forklift.konveyor.io/provider-cleanup"));

    api.delete("e2e-host", &DeleteParams::default()).await.expect("Failed to delete provider");
}

#[tokio::test]
#[ignore]
async fn test_hook_without_image_is_rejected() {
    let api: Api<Hook> = Api::namespaced(client().await, &namespace());
    let hook = Hook::new("e2e-hook", HookSpec::default());
    api.create(&PostParams::default(), &hook).await.expect("Failed to create hook");

    let rejected = wait_for(&api, "e2e-hook", |h: &Hook| {
        h.status.as_ref().is_some_and(|s| crds::is_condition_true(&s.conditions, "ImageNotValid"))
    })
    .await;
    let status = rejected.status.unwrap_or_default();
    assert!(crds::has_blocker(&status.conditions));

    api.delete("e2e-hook", &DeleteParams::default()).await.expect("Failed to delete hook");
}
