//! Provider reconciliation.
//!
//! A provider becomes Ready once its settings validate, the source accepts its credentials
//! and the inventory has collected it. OVA providers additionally get an inventory server
//! record in the controller namespace; the record and every object spawned for it are
//! removed by label when the provider is deleted.

use crate::adapter::{AdapterFactory, SecretData};
use crate::builder::conversion::nfs_export;
use crate::builder::ova_server::{build_server_record, provider_selector, server_name};
use crate::error::ControllerError;
use crate::reconcile_helpers::object_key;
use crate::reconciler::Reconciler;
use chrono::Utc;
use crds::{has_blocker, merge_conditions, types, Category, Condition, OVAProviderServer, Provider, ProviderStatus, ProviderType};
use inventory_client::{InventoryClientTrait, InventoryError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Finalizer guarding the teardown of provider-owned objects
pub const FINALIZER: &str = "forklift.konveyor.io/provider-cleanup";

/// Condition types written by the provider controller
pub mod conditions {
    pub const CONNECTION_TEST_SUCCEEDED: &str = "ConnectionTestSucceeded";
    pub const INVENTORY_CREATED: &str = "InventoryCreated";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Problems with the provider's own settings and its secret.
///
/// `secret` is `None` when the referenced secret does not exist.
pub fn validate_provider(provider: &Provider, secret: Option<&SecretData>) -> Vec<Condition> {
    let spec = &provider.spec;
    let mut out = Vec::new();
    let url_required = !matches!(spec.type_, ProviderType::OpenShift | ProviderType::Ec2);
    if url_required && spec.url.is_empty() {
        out.push(Condition::critical(conditions::VALIDATION_FAILED, "UrlNotValid", "The provider URL is not set."));
    } else if spec.type_ == ProviderType::Ova {
        if let Err(e) = nfs_export(&spec.url) {
            out.push(Condition::critical(conditions::VALIDATION_FAILED, "UrlNotValid", e.to_string()));
        }
    }
    if spec.type_ == ProviderType::Ec2 && !spec.settings.contains_key(crds::settings::REGION) {
        out.push(Condition::critical(conditions::VALIDATION_FAILED, "SettingsNotValid", "The EC2 region is not set."));
    }

    let required = spec.type_.required_secret_keys();
    let needs_secret = !required.is_empty() || (spec.type_ == ProviderType::OpenShift && !provider.is_host());
    match (&spec.secret, secret) {
        (None, _) if needs_secret => out.push(Condition::critical(
            conditions::VALIDATION_FAILED,
            "SecretNotSet",
            format!("A secret is required for {} providers.", spec.type_),
        )),
        (Some(reference), None) => out.push(Condition::critical(
            conditions::VALIDATION_FAILED,
            "SecretNotFound",
            format!("Secret '{}' not found.", reference.name),
        )),
        (Some(_), Some(data)) => {
            let missing: Vec<&str> = required.iter().copied().filter(|k| !data.contains_key(*k)).collect();
            if !missing.is_empty() {
                out.push(Condition::critical(
                    conditions::VALIDATION_FAILED,
                    "SecretKeysMissing",
                    format!("Secret is missing keys: {}.", missing.join(", ")),
                ));
            }
        }
        _ => {}
    }
    out
}

fn failed_connection(message: impl Into<String>) -> Condition {
    Condition {
        status: "False".to_string(),
        ..Condition::new(conditions::CONNECTION_TEST_SUCCEEDED, Category::Critical, "ConnectionFailed", message)
    }
}

fn inventory_pending(message: impl Into<String>) -> Condition {
    Condition {
        status: "False".to_string(),
        ..Condition::new(conditions::INVENTORY_CREATED, Category::Advisory, "NotCollected", message)
    }
}

/// Test the connection and the inventory of a provider whose settings validated.
///
/// Rejected credentials and a missing inventory turn into "False" conditions; transport
/// failures are returned so the reconcile is retried with backoff.
pub async fn probe_provider(
    adapters: &dyn AdapterFactory,
    inventory: &dyn InventoryClientTrait,
    provider: &Provider,
) -> Result<Vec<Condition>, ControllerError> {
    let tested = match adapters.adapter(provider).await {
        Ok(adapter) => adapter.test_connection().await.map_err(ControllerError::from),
        Err(e) => Err(e),
    };
    match tested {
        Ok(()) => {}
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => return Ok(vec![failed_connection(e.to_string())]),
    }
    let mut out = vec![Condition::new(
        conditions::CONNECTION_TEST_SUCCEEDED,
        Category::Required,
        "Tested",
        "Connection test succeeded.",
    )];

    let uid = provider.uid().unwrap_or_default();
    match inventory.get_provider(provider.spec.type_, &uid).await {
        Ok(info) => {
            debug!("Inventory of provider {} holds {:?} VMs", info.name, info.vm_count);
            out.push(Condition::new(
                conditions::INVENTORY_CREATED,
                Category::Required,
                "Completed",
                "The inventory has been loaded.",
            ));
            out.push(Condition::ready("The provider is ready."));
        }
        Err(InventoryError::NotFound(_) | InventoryError::NotReady(_)) => {
            out.push(inventory_pending("The inventory has not been collected yet."));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(out)
}

/// Status to store; the inventory service reference is owned by the server controller
pub fn provider_status(provider: &Provider, desired: Vec<Condition>) -> ProviderStatus {
    let current = provider.status.clone().unwrap_or_default();
    ProviderStatus {
        conditions: merge_conditions(&current.conditions, desired, &[], Utc::now()),
        observed_generation: provider.meta().generation,
        service: current.service,
    }
}

impl Reconciler {
    /// Reconciles a Provider.
    pub async fn reconcile_provider(&self, provider: Arc<Provider>) -> Result<Action, ControllerError> {
        let namespace = provider.namespace().unwrap_or_default();
        let api: Api<Provider> = self.api(&namespace);
        finalizer(&api, FINALIZER, provider, |event| async move {
            match event {
                Event::Apply(provider) => self.apply_provider(&provider).await,
                Event::Cleanup(provider) => self.cleanup_provider(&provider).await,
            }
        })
        .await
        .map_err(|e| ControllerError::Finalizer(Box::new(e)))
    }

    async fn apply_provider(&self, provider: &Provider) -> Result<Action, ControllerError> {
        let key = object_key(provider);
        info!("Reconciling {}", key);

        let secret = self.provider_secret(provider).await?;
        let mut desired = validate_provider(provider, secret.as_ref());
        if !has_blocker(&desired) {
            if provider.spec.type_ == ProviderType::Ova {
                self.ensure_ova_server(provider).await?;
            }
            let probed = self
                .call("test provider", probe_provider(self.adapters.as_ref(), self.inventory.as_ref(), provider))
                .await?;
            desired.extend(probed);
        }
        let ready = crds::find_condition(&desired, types::READY).is_some();
        let status = provider_status(provider, desired);
        let outcome = self.write_status(provider, provider.status.as_ref(), &status).await?;
        debug!("{} status: {:?}", key, outcome);

        self.reconciled(&key);
        if ready {
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(self.config.poll_interval))
        }
    }

    async fn ensure_ova_server(&self, provider: &Provider) -> Result<(), ControllerError> {
        let namespace = &self.config.pod_namespace;
        let api: Api<OVAProviderServer> = self.api(namespace);
        let name = server_name(&provider.uid().unwrap_or_default());
        if self.call("get provider server", api.get_opt(&name)).await?.is_some() {
            return Ok(());
        }
        info!("Creating OVAProviderServer {}/{} for provider {}", namespace, name, provider.name_any());
        let server = build_server_record(provider, namespace);
        match api.create(&PostParams::default(), &server).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_provider(&self, provider: &Provider) -> Result<Action, ControllerError> {
        let key = object_key(provider);
        if provider.spec.type_ != ProviderType::Ova {
            debug!("{} owns no inventory server", key);
            return Ok(Action::await_change());
        }
        info!("Removing inventory server of {}", key);
        let selector = provider_selector(&provider.uid().unwrap_or_default());
        let namespace = &self.config.pod_namespace;
        self.delete_labeled::<OVAProviderServer>(self.api(namespace), &selector).await?;
        self.delete_labeled::<Deployment>(self.api(namespace), &selector).await?;
        self.delete_labeled::<Service>(self.api(namespace), &selector).await?;
        self.delete_labeled::<PersistentVolumeClaim>(self.api(namespace), &selector).await?;
        self.delete_labeled::<PersistentVolume>(Api::all(self.client.clone()), &selector).await?;
        self.reconciled(&key);
        Ok(Action::await_change())
    }

    /// List-and-delete every object matching `selector`
    async fn delete_labeled<K>(&self, api: Api<K>, selector: &str) -> Result<(), ControllerError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let objects = self.call("list owned objects", api.list(&ListParams::default().labels(selector))).await?;
        for obj in objects {
            let name = obj.name_any();
            debug!("Deleting {} {}", K::kind(&()), name);
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    warn!("Failed to delete {} {}: {}", K::kind(&()), name, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
