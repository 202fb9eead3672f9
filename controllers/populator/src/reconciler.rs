//! Reconciliation logic for claims backed by a populator object.
//!
//! Every reconcile re-reads the claim, the populator object, the prime claim and the pod, and
//! derives the next step from what exists. Nothing is kept in memory between passes.

use crate::backoff::BackoffTable;
use crate::config::Config;
use crate::error::ControllerError;
use crate::populator::{api_resource, PopulatorSource};
use crate::resources;
use crds::{PopulatorKind, PopulatorPhase, PopulatorStatus};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue interval while a pod is pending or running
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Exit code of a worker that failed permanently
pub const PERMANENT_EXIT_CODE: i32 = 2;

/// Observed state of the populator pod
#[derive(Debug, Clone, PartialEq)]
pub enum PodState {
    Missing,
    Active,
    Succeeded,
    Failed { exit_code: Option<i32>, message: String },
}

impl PodState {
    pub fn of(pod: Option<&Pod>) -> Self {
        let Some(pod) = pod else {
            return Self::Missing;
        };
        let status = pod.status.as_ref();
        match status.and_then(|s| s.phase.as_deref()) {
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => {
                let terminated = status
                    .and_then(|s| s.container_statuses.as_ref())
                    .and_then(|statuses| statuses.first())
                    .and_then(|cs| cs.state.as_ref())
                    .and_then(|state| state.terminated.as_ref());
                let message = terminated
                    .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
                    .or_else(|| status.and_then(|s| s.message.clone()))
                    .unwrap_or_else(|| "populator pod failed".to_string());
                Self::Failed {
                    exit_code: terminated.map(|t| t.exit_code),
                    message: message.trim().to_string(),
                }
            }
            _ => Self::Active,
        }
    }
}

/// What the next pass does
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The populator object does not exist yet
    WaitForPopulator,
    /// The claim is bound; drop scratch objects and record success
    Complete,
    /// The populator gave up earlier
    Stop,
    CreatePrimeClaim,
    CreatePod,
    /// Pod is running
    Wait,
    /// Move the prime volume to the claim
    Rebind,
    /// Recreate the pod after a transient failure
    Retry { retries: u32, cause: String },
    /// Give up
    Fail { cause: String },
}

/// Derive the next step from the observed objects
pub fn next_step(
    claim_bound: bool,
    status: Option<&PopulatorStatus>,
    prime_exists: bool,
    pod: &PodState,
    retry_limit: u32,
) -> Step {
    if claim_bound {
        return Step::Complete;
    }
    let Some(status) = status else {
        return Step::WaitForPopulator;
    };
    match status.phase {
        PopulatorPhase::Failed => return Step::Stop,
        PopulatorPhase::Succeeded => return Step::Complete,
        _ => {}
    }
    if !prime_exists {
        return Step::CreatePrimeClaim;
    }
    match pod {
        PodState::Missing => Step::CreatePod,
        PodState::Active => Step::Wait,
        PodState::Succeeded => Step::Rebind,
        PodState::Failed { exit_code, message } => {
            let cause = match exit_code {
                Some(code) => format!("exit code {}: {}", code, message),
                None => message.clone(),
            };
            if *exit_code == Some(PERMANENT_EXIT_CODE) || status.retries >= retry_limit {
                Step::Fail { cause }
            } else {
                Step::Retry {
                    retries: status.retries + 1,
                    cause,
                }
            }
        }
    }
}

/// Status patch recording a finished population
pub fn succeeded_status(status: &PopulatorStatus) -> serde_json::Value {
    serde_json::json!({
        "phase": "Succeeded",
        "progress": "100%",
        "transferred": status.total.max(status.transferred),
    })
}

/// Backoff key of a claim
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!("PersistentVolumeClaim/{}/{}", claim.namespace().unwrap_or_default(), claim.name_any())
}

/// The populator kind and object name referenced by a claim
pub fn populator_ref(claim: &PersistentVolumeClaim) -> Option<(PopulatorKind, String)> {
    let source = claim.spec.as_ref()?.data_source_ref.as_ref()?;
    if source.api_group.as_deref() != Some(crds::GROUP) {
        return None;
    }
    PopulatorKind::from_kind(&source.kind).map(|kind| (kind, source.name.clone()))
}

/// Reconciles claims whose `dataSourceRef` names a populator object.
pub struct Reconciler {
    client: Client,
    config: Config,
    backoff: BackoffTable,
}

impl Reconciler {
    pub fn new(client: Client, config: Config) -> Self {
        let backoff = BackoffTable::new(config.backoff_min_seconds, config.backoff_max_seconds);
        Self { client, config, backoff }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Forget the failures of a claim after a successful reconcile
    pub fn reconciled(&self, key: &str) {
        let failures = self.backoff.error_count(key);
        if failures > 0 {
            info!("{} recovered after {} failed attempts", key, failures);
            self.backoff.reset(key);
        }
    }

    /// Requeue delay after a failed reconcile, growing with consecutive failures of the claim
    pub fn error_action(&self, key: &str, err: &ControllerError) -> Action {
        let requeue = self.backoff.record_failure(key);
        if requeue.should_surface() {
            error!("Reconciliation failed for {} (attempt {}): {}", key, requeue.error_count, err);
        } else {
            warn!(
                "Reconciliation failed for {} (attempt {}), retrying in {:?}: {}",
                key, requeue.error_count, requeue.delay, err
            );
        }
        Action::requeue(requeue.delay)
    }

    /// Reconcile one claim
    pub async fn reconcile_claim(&self, claim: &PersistentVolumeClaim) -> Result<Action, ControllerError> {
        let Some((kind, cr_name)) = populator_ref(claim) else {
            return Ok(Action::await_change());
        };
        let namespace = claim
            .namespace()
            .ok_or_else(|| ControllerError::Validation("claim has no namespace".to_string()))?;
        let claim_uid = claim
            .uid()
            .ok_or_else(|| ControllerError::Validation("claim has no uid".to_string()))?;
        info!("Reconciling PersistentVolumeClaim {}/{} ({} {})", namespace, claim.name_any(), kind, cr_name);

        let populators: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, &api_resource(kind));
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let populator = populators.get_opt(&cr_name).await?;
        let decoded = populator
            .as_ref()
            .map(|obj| PopulatorSource::from_object(kind, obj))
            .transpose()?;

        let prime_name = resources::prime_claim_name(&claim_uid);
        let pod_name = resources::pod_name(&claim_uid);
        let prime = claims.get_opt(&prime_name).await?;
        let pod = pods.get_opt(&pod_name).await?;
        let pod_state = PodState::of(pod.as_ref());

        let claim_bound = claim.spec.as_ref().and_then(|s| s.volume_name.as_ref()).is_some();
        let step = next_step(
            claim_bound,
            decoded.as_ref().map(|(_, status)| status),
            prime.is_some(),
            &pod_state,
            self.config.retry_limit(kind),
        );
        debug!("Claim {}/{}: {:?}", namespace, claim.name_any(), step);

        match step {
            Step::Stop => Ok(Action::await_change()),
            Step::WaitForPopulator => {
                info!("Waiting for {} {}/{}", kind, namespace, cr_name);
                Ok(Action::requeue(POLL_INTERVAL))
            }
            Step::Complete => {
                self.delete_scratch(&pods, &claims, &pod_name, &prime_name).await?;
                if let Some((_, status)) = &decoded {
                    if status.phase != PopulatorPhase::Succeeded {
                        self.patch_status(&populators, &cr_name, succeeded_status(status)).await?;
                    }
                }
                Ok(Action::await_change())
            }
            Step::CreatePrimeClaim => {
                let (source, obj) = Self::loaded(&decoded, &populator)?;
                let owner = Self::owner(kind, obj)?;
                let prime_claim = resources::build_prime_claim(claim, &claim_uid, owner);
                info!("Creating prime claim {}/{} for {}", namespace, prime_name, source.kind());
                Self::create_if_absent(claims.create(&PostParams::default(), &prime_claim).await)?;
                Ok(Action::requeue(POLL_INTERVAL))
            }
            Step::CreatePod => {
                let (source, obj) = Self::loaded(&decoded, &populator)?;
                let image = match source.own_image() {
                    Some(image) => image.to_string(),
                    None => self.config.images.get(&kind).cloned().ok_or_else(|| {
                        ControllerError::InvalidConfig(format!("no populator image configured for {}", kind))
                    })?,
                };
                let owner = Self::owner(kind, obj)?;
                let pod = resources::build_populator_pod(claim, &claim_uid, source, &image, &cr_name, owner);
                info!("Creating populator pod {}/{}", namespace, pod_name);
                Self::create_if_absent(pods.create(&PostParams::default(), &pod).await)?;
                self.patch_status(&populators, &cr_name, serde_json::json!({"phase": "Running"}))
                    .await?;
                Ok(Action::requeue(POLL_INTERVAL))
            }
            Step::Wait => Ok(Action::requeue(POLL_INTERVAL)),
            Step::Rebind => {
                let prime = prime.ok_or_else(|| ControllerError::Validation(format!("prime claim {} vanished", prime_name)))?;
                let Some(volume) = prime.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
                    debug!("Prime claim {}/{} is not bound yet", namespace, prime_name);
                    return Ok(Action::requeue(POLL_INTERVAL));
                };
                info!("Rebinding volume {} to claim {}/{}", volume, namespace, claim.name_any());
                let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
                volumes
                    .patch(&volume, &PatchParams::default(), &Patch::Merge(&resources::rebind_patch(claim)))
                    .await?;
                // Recorded before the scratch objects go, so a pass that still sees the claim
                // unbound completes instead of populating again
                if let Some((_, status)) = &decoded {
                    self.patch_status(&populators, &cr_name, succeeded_status(status)).await?;
                }
                self.delete_scratch(&pods, &claims, &pod_name, &prime_name).await?;
                Ok(Action::requeue(POLL_INTERVAL))
            }
            Step::Retry { retries, cause } => {
                warn!(
                    "Populator pod {}/{} failed ({}), retry {}/{}",
                    namespace,
                    pod_name,
                    cause,
                    retries,
                    self.config.retry_limit(kind)
                );
                Self::ignore_not_found(pods.delete(&pod_name, &DeleteParams::background()).await)?;
                self.patch_status(&populators, &cr_name, serde_json::json!({"retries": retries}))
                    .await?;
                Ok(Action::requeue(POLL_INTERVAL))
            }
            Step::Fail { cause } => {
                warn!("{} {}/{} failed: {}", kind, namespace, cr_name, cause);
                self.patch_status(
                    &populators,
                    &cr_name,
                    serde_json::json!({"phase": "Failed", "failure": cause}),
                )
                .await?;
                Ok(Action::await_change())
            }
        }
    }

    fn loaded<'a>(
        decoded: &'a Option<(PopulatorSource, PopulatorStatus)>,
        obj: &'a Option<DynamicObject>,
    ) -> Result<(&'a PopulatorSource, &'a DynamicObject), ControllerError> {
        match (decoded, obj) {
            (Some((source, _)), Some(obj)) => Ok((source, obj)),
            _ => Err(ControllerError::Validation("populator object vanished".to_string())),
        }
    }

    fn owner(kind: PopulatorKind, obj: &DynamicObject) -> Result<OwnerReference, ControllerError> {
        let uid = obj
            .uid()
            .ok_or_else(|| ControllerError::Validation(format!("{} {} has no uid", kind, obj.name_any())))?;
        Ok(resources::owner_reference(kind.kind(), &obj.name_any(), &uid))
    }

    async fn patch_status(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn delete_scratch(
        &self,
        pods: &Api<Pod>,
        claims: &Api<PersistentVolumeClaim>,
        pod_name: &str,
        prime_name: &str,
    ) -> Result<(), ControllerError> {
        Self::ignore_not_found(pods.delete(pod_name, &DeleteParams::background()).await)?;
        Self::ignore_not_found(claims.delete(prime_name, &DeleteParams::background()).await)?;
        Ok(())
    }

    fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), ControllerError> {
        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn create_if_absent<T>(result: Result<T, kube::Error>) -> Result<(), ControllerError> {
        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
