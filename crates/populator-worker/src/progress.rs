//! Progress reporting into the populator object status
//!
//! Updates are rate limited. A failed status write is logged and otherwise ignored, since
//! losing a progress update must never fail a transfer.

use crate::error::PopulatorError;
use crds::{PopulatorKind, GROUP, VERSION};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default minimum time between two status writes
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Progress fields written by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub progress: String,
    pub transferred: u64,
    pub total: u64,
}

#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, update: &ProgressUpdate) -> Result<(), PopulatorError>;
}

/// Patches the status subresource of the populator object
pub struct KubeStatusWriter {
    api: Api<DynamicObject>,
    name: String,
}

impl std::fmt::Debug for KubeStatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStatusWriter").field("name", &self.name).finish_non_exhaustive()
    }
}

impl KubeStatusWriter {
    pub async fn connect(kind: PopulatorKind, name: &str, namespace: &str) -> Result<Self, PopulatorError> {
        let client = Client::try_default().await?;
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, kind.kind());
        let resource = ApiResource::from_gvk(&gvk);
        Ok(Self {
            api: Api::namespaced_with(client, namespace, &resource),
            name: name.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, update: &ProgressUpdate) -> Result<(), PopulatorError> {
        let patch = serde_json::json!({
            "status": {
                "phase": "Running",
                "progress": update.progress,
                "transferred": update.transferred,
                "total": update.total,
            }
        });
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Tracks bytes written and forwards them to a `StatusWriter`
pub struct ProgressReporter {
    writer: Arc<dyn StatusWriter>,
    interval: Duration,
    last: Option<Instant>,
    transferred: u64,
    total: u64,
    percent_only: Option<u8>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("transferred", &self.transferred)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(writer: Arc<dyn StatusWriter>, interval: Duration) -> Self {
        Self {
            writer,
            interval,
            last: None,
            transferred: 0,
            total: 0,
            percent_only: None,
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Count `bytes` more and report if the interval has passed
    pub async fn add(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes);
        self.maybe_flush().await;
    }

    /// Report a percentage when the byte counts are unknown
    pub async fn set_percent(&mut self, percent: u8) {
        self.percent_only = Some(percent.min(100));
        self.maybe_flush().await;
    }

    /// Final report, always written
    pub async fn finish(&mut self) {
        if self.total > 0 {
            self.transferred = self.total;
        }
        if self.percent_only.is_some() {
            self.percent_only = Some(100);
        }
        self.flush().await;
    }

    pub fn update(&self) -> ProgressUpdate {
        let progress = match self.percent_only {
            Some(p) => format!("{}%", p),
            None => percent(self.transferred, self.total),
        };
        ProgressUpdate {
            progress,
            transferred: self.transferred,
            total: self.total,
        }
    }

    async fn maybe_flush(&mut self) {
        let due = self.last.is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.last = Some(Instant::now());
        let update = self.update();
        debug!("Progress {} ({}/{})", update.progress, update.transferred, update.total);
        if let Err(e) = self.writer.write(&update).await {
            warn!("Failed to report progress: {}", e);
        }
    }
}

/// Percentage string, clamped to 100
pub fn percent(transferred: u64, total: u64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    let pct = (u128::from(transferred) * 100 / u128::from(total)).min(100);
    format!("{}%", pct)
}
