//! Kubernetes Events emitted next to status conditions.
//!
//! Publishing is best effort: a failed publish is logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Reason of the warning emitted when a warm migration gets a default cutover
pub const CUTOVER_DEFAULTED: &str = "CutoverDefaulted";
/// Reason of the warning emitted when the requested cutover is already past
pub const CUTOVER_IN_PAST: &str = "CutoverInPast";
/// Reason used when a reconcile keeps failing
pub const RECONCILE_FAILED: &str = "ReconcileFailed";

/// Destination of controller events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish a Normal event
    async fn normal(&self, regarding: &ObjectReference, reason: &str, note: &str);

    /// Publish a Warning event
    async fn warning(&self, regarding: &ObjectReference, reason: &str, note: &str);
}

/// Events written through the API server
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    /// Create a sink reporting as `forklift-controller`
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "forklift-controller".to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { recorder: Recorder::new(client, reporter) }
    }

    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: &str) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                "Failed to publish {} event for {}: {}",
                reason,
                regarding.name.as_deref().unwrap_or_default(),
                e
            );
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn normal(&self, regarding: &ObjectReference, reason: &str, note: &str) {
        self.publish(regarding, EventType::Normal, reason, note).await;
    }

    async fn warning(&self, regarding: &ObjectReference, reason: &str, note: &str) {
        self.publish(regarding, EventType::Warning, reason, note).await;
    }
}
