//! OVAProviderServer reconciliation.
//!
//! Each server record turns into a Retain volume on the provider's NFS export, a claim bound
//! to it, the catalog Deployment and its Service. The record goes Ready once the Service has
//! endpoints, and the Service reference is then copied into the provider status so the
//! inventory proxy can find it.

use crate::builder::ova_server::{
    build_claim, build_deployment, build_service, build_volume, endpoints_ready, provider_selector, ServerContext,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::object_key;
use crate::reconciler::Reconciler;
use chrono::{DateTime, Utc};
use crds::{
    merge_conditions, types, Condition, OVAProviderServer, Provider, ProviderServerPhase, ProviderServerStatus,
    ProviderStatus, ResourceRef,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolume, PersistentVolumeClaim, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

const SERVICE_NOT_READY: &str = "ServiceNotReady";
const PROVIDER_NOT_FOUND: &str = "ProviderNotFound";
const CREATE_FAILED: &str = "CreateFailed";

/// Status of a server whose objects exist; Ready once the Service has endpoints
pub fn server_status(
    current: Option<&ProviderServerStatus>,
    service: ResourceRef,
    service_ready: bool,
    now: DateTime<Utc>,
) -> ProviderServerStatus {
    let (phase, desired) = if service_ready {
        (ProviderServerPhase::Ready, Condition::ready("The inventory server is ready."))
    } else {
        (
            ProviderServerPhase::Pending,
            Condition::advisory(SERVICE_NOT_READY, "NoEndpoints", "Waiting for the inventory service endpoints."),
        )
    };
    ProviderServerStatus {
        phase,
        conditions: merge_conditions(current.map_or(&[][..], |s| &s.conditions), vec![desired], &[], now),
        service: Some(service),
    }
}

/// Status of a server that cannot be built
pub fn failed_status(
    current: Option<&ProviderServerStatus>,
    condition: Condition,
    now: DateTime<Utc>,
) -> ProviderServerStatus {
    ProviderServerStatus {
        phase: ProviderServerPhase::Failed,
        conditions: merge_conditions(current.map_or(&[][..], |s| &s.conditions), vec![condition], &[], now),
        service: None,
    }
}

/// Provider status carrying `service`, `None` when it already does
pub fn provider_with_service(provider: &Provider, service: &ResourceRef) -> Option<ProviderStatus> {
    let current = provider.status.clone().unwrap_or_default();
    if current.service.as_ref() == Some(service) {
        return None;
    }
    Some(ProviderStatus { service: Some(service.clone()), ..current })
}

impl Reconciler {
    /// Reconciles an OVAProviderServer.
    pub async fn reconcile_provider_server(&self, server: &OVAProviderServer) -> Result<Action, ControllerError> {
        let key = object_key(server);
        info!("Reconciling {}", key);
        let namespace = server.namespace().unwrap_or_default();
        let current = server.status.as_ref();
        let now = Utc::now();

        let Some(provider) = self.lookup::<Provider>(&server.spec.provider, &namespace).await? else {
            let condition = Condition::critical(
                PROVIDER_NOT_FOUND,
                "NotFound",
                format!("Provider '{}' not found.", server.spec.provider.name),
            );
            let status = ProviderServerStatus { phase: ProviderServerPhase::Pending, ..failed_status(current, condition, now) };
            self.write_status(server, current, &status).await?;
            return Ok(Action::requeue(self.config.poll_interval));
        };

        let ctx = ServerContext { server, provider: &provider, image: &self.config.ova_server_image };
        let volume = match build_volume(&ctx) {
            Ok(volume) => volume,
            Err(e) => {
                let condition = Condition::critical(CREATE_FAILED, "NotValid", e.to_string());
                self.write_status(server, current, &failed_status(current, condition, now)).await?;
                self.reconciled(&key);
                return Ok(Action::await_change());
            }
        };
        self.create_if_missing(&Api::<PersistentVolume>::all(self.client.clone()), &volume).await?;
        self.create_if_missing(&self.api::<PersistentVolumeClaim>(&namespace), &build_claim(&ctx)).await?;
        let deployment = build_deployment(&ctx);
        self.create_if_missing(&self.api::<Deployment>(&namespace), &deployment).await?;
        let service = build_service(&ctx);
        self.create_if_missing(&self.api::<Service>(&namespace), &service).await?;
        self.remove_stale_deployments(&provider, &namespace, &deployment.name_any()).await?;

        let service_ref = ResourceRef::with_namespace(service.name_any(), namespace.clone());
        let endpoints: Api<Endpoints> = self.api(&namespace);
        let ready = self
            .call("get service endpoints", endpoints.get_opt(&service.name_any()))
            .await?
            .as_ref()
            .is_some_and(endpoints_ready);
        let status = server_status(current, service_ref.clone(), ready, now);
        self.write_status(server, current, &status).await?;

        if !ready {
            debug!("{} waiting for endpoints", key);
            return Ok(Action::requeue(self.config.poll_interval));
        }
        if let Some(desired) = provider_with_service(&provider, &service_ref) {
            info!("Provider {} served by {}/{}", provider.name_any(), namespace, service_ref.name);
            self.write_status(&provider, provider.status.as_ref(), &desired).await?;
        }
        self.reconciled(&key);
        Ok(Action::await_change())
    }

    async fn create_if_missing<K>(&self, api: &Api<K>, obj: &K) -> Result<(), ControllerError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = obj.name_any();
        if self.call("get server object", api.get_opt(&name)).await?.is_some() {
            return Ok(());
        }
        info!("Creating {} {}", K::kind(&()), name);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep a single catalog Deployment per provider
    async fn remove_stale_deployments(&self, provider: &Provider, namespace: &str, keep: &str) -> Result<(), ControllerError> {
        let api: Api<Deployment> = self.api(namespace);
        let selector = provider_selector(&provider.uid().unwrap_or_default());
        let deployments = self.call("list server deployments", api.list(&ListParams::default().labels(&selector))).await?;
        for stale in deployments.into_iter().filter(|d| d.name_any() != keep) {
            info!("Deleting stale inventory server {}/{}", namespace, stale.name_any());
            self.call("delete server deployment", api.delete(&stale.name_any(), &DeleteParams::background()))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_provider;
    use chrono::TimeZone;
    use crds::{has_blocker, ProviderType};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
    }

    fn service() -> ResourceRef {
        ResourceRef::with_namespace("ova-server-ova-u", "konveyor-forklift")
    }

    #[test]
    fn test_pending_until_endpoints() {
        let pending = server_status(None, service(), false, now());
        assert_eq!(pending.phase, ProviderServerPhase::Pending);
        assert!(!has_blocker(&pending.conditions));
        assert!(crds::find_condition(&pending.conditions, types::READY).is_none());

        let ready = server_status(Some(&pending), service(), true, now());
        assert_eq!(ready.phase, ProviderServerPhase::Ready);
        assert!(crds::is_condition_true(&ready.conditions, types::READY));
        assert!(crds::find_condition(&ready.conditions, SERVICE_NOT_READY).is_none());
        assert_eq!(ready.service, Some(service()));
    }

    #[test]
    fn test_unchanged_status_keeps_transition_time() {
        let first = server_status(None, service(), true, now());
        let later = server_status(Some(&first), service(), true, now() + chrono::Duration::hours(1));
        assert_eq!(first, later);
    }

    #[test]
    fn test_failed_status() {
        let condition = Condition::critical(CREATE_FAILED, "NotValid", "invalid NFS export 'nfs'");
        let status = failed_status(None, condition, now());
        assert_eq!(status.phase, ProviderServerPhase::Failed);
        assert!(has_blocker(&status.conditions));
        assert!(status.service.is_none());
    }

    #[test]
    fn test_service_written_once() {
        let mut provider = create_test_provider("ova", ProviderType::Ova, true);
        let desired = provider_with_service(&provider, &service()).unwrap();
        assert_eq!(desired.service, Some(service()));
        assert!(crds::is_condition_true(&desired.conditions, types::READY));

        provider.status = Some(desired);
        assert!(provider_with_service(&provider, &service()).is_none());
    }
}
