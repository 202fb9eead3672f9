//! Prometheus metrics and the probe server.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `forklift_plans_status_total` | Counter | `status`, `provider`, `mode`, `target` |
//! | `forklift_migrations_status_total` | Counter | `status`, `provider`, `mode`, `target` |
//! | `forklift_migration_duration_seconds` | Histogram | `provider`, `mode`, `target` |
//! | `forklift_migration_data_transferred_bytes` | Gauge | `namespace`, `plan` |
//!
//! Counters are driven by reconciles, which run many times per object. Each object UID is
//! counted once per status through the processed sets kept here; they are process-local and
//! lost on restart, which only affects the exported totals.

use crate::error::ControllerError;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use crds::{MigrationType, Provider};
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// Buckets of the migration duration histogram (seconds): 1m to 2d
pub const DURATION_BUCKETS: &[f64] = &[60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 43200.0, 86400.0, 172800.0];

const MIB: f64 = 1_048_576.0;

/// Labels describing what a plan or migration moves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLabels {
    /// Source provider type
    pub provider: String,
    /// Migration type
    pub mode: String,
    /// "Local" when the destination is the host cluster, else "Remote"
    pub target: String,
}

impl MigrationLabels {
    /// Labels of a plan moving VMs from `source` to `destination`
    pub fn new(source: &Provider, destination: &Provider, mode: MigrationType) -> Self {
        Self {
            provider: source.spec.type_.as_str().to_string(),
            mode: mode.as_str().to_string(),
            target: if destination.is_host() { "Local" } else { "Remote" }.to_string(),
        }
    }
}

/// Forklift controller metrics
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    plans_status_total: CounterVec,
    migrations_status_total: CounterVec,
    migration_duration_seconds: HistogramVec,
    migration_data_transferred_bytes: GaugeVec,
    counted_plans: Mutex<HashSet<String>>,
    counted_migrations: Mutex<HashSet<String>>,
    ready: AtomicBool,
}

impl Metrics {
    /// Create and register every metric family
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let plans_status_total = CounterVec::new(
            Opts::new("forklift_plans_status_total", "Plans by observed status"),
            &["status", "provider", "mode", "target"],
        )?;
        registry.register(Box::new(plans_status_total.clone()))?;

        let migrations_status_total = CounterVec::new(
            Opts::new("forklift_migrations_status_total", "Migrations by terminal status"),
            &["status", "provider", "mode", "target"],
        )?;
        registry.register(Box::new(migrations_status_total.clone()))?;

        let migration_duration_seconds = HistogramVec::new(
            HistogramOpts::new("forklift_migration_duration_seconds", "Duration of completed migrations")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["provider", "mode", "target"],
        )?;
        registry.register(Box::new(migration_duration_seconds.clone()))?;

        let migration_data_transferred_bytes = GaugeVec::new(
            Opts::new("forklift_migration_data_transferred_bytes", "Disk data transferred by the running migration of a plan"),
            &["namespace", "plan"],
        )?;
        registry.register(Box::new(migration_data_transferred_bytes.clone()))?;

        Ok(Self {
            registry,
            plans_status_total,
            migrations_status_total,
            migration_duration_seconds,
            migration_data_transferred_bytes,
            counted_plans: Mutex::new(HashSet::new()),
            counted_migrations: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
        })
    }

    /// Count a plan status once per plan UID and status.
    ///
    /// Returns false when this UID was already counted with this status.
    pub fn record_plan_status(&self, uid: &str, status: &str, labels: &MigrationLabels) -> bool {
        let key = format!("{}/{}", uid, status);
        let mut counted = self.counted_plans.lock().unwrap_or_else(|e| e.into_inner());
        if !counted.insert(key) {
            return false;
        }
        self.plans_status_total
            .with_label_values(&[status, &labels.provider, &labels.mode, &labels.target])
            .inc();
        true
    }

    /// Count a completed migration once per migration UID
    pub fn record_migration_completion(
        &self,
        uid: &str,
        status: &str,
        labels: &MigrationLabels,
        duration: Option<Duration>,
    ) -> bool {
        let mut counted = self.counted_migrations.lock().unwrap_or_else(|e| e.into_inner());
        if !counted.insert(uid.to_string()) {
            return false;
        }
        self.migrations_status_total
            .with_label_values(&[status, &labels.provider, &labels.mode, &labels.target])
            .inc();
        if let Some(duration) = duration {
            self.migration_duration_seconds
                .with_label_values(&[&labels.provider, &labels.mode, &labels.target])
                .observe(duration.as_secs_f64());
        }
        true
    }

    /// Publish transferred data of a plan; pipeline progress is kept in MiB
    pub fn set_data_transferred(&self, namespace: &str, plan: &str, mebibytes: i64) {
        self.migration_data_transferred_bytes
            .with_label_values(&[namespace, plan])
            .set(mebibytes.max(0) as f64 * MIB);
    }

    /// Mark the controller ready once every watcher started
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// True once the controller is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Encode every registered family in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Serve `/metrics`, `/healthz` and `/readyz` until the listener fails
pub async fn run_metrics_server(metrics: Arc<Metrics>, port: u16) -> Result<(), ControllerError> {
    let metrics_handler = {
        let metrics = Arc::clone(&metrics);
        move || {
            let metrics = Arc::clone(&metrics);
            async move {
                match metrics.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {e}")).into_response()
                    }
                }
            }
        }
    };
    let ready_handler = {
        let metrics = Arc::clone(&metrics);
        move || {
            let metrics = Arc::clone(&metrics);
            async move {
                if metrics.is_ready() {
                    (StatusCode::OK, "ready")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "starting")
                }
            }
        }
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(ready_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server cannot bind {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> MigrationLabels {
        MigrationLabels {
            provider: "vsphere".to_string(),
            mode: "cold".to_string(),
            target: "Local".to_string(),
        }
    }

    #[test]
    fn test_migration_counted_once_per_uid() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_migration_completion("m-1", "Succeeded", &labels(), Some(Duration::from_secs(90))));
        assert!(!metrics.record_migration_completion("m-1", "Succeeded", &labels(), Some(Duration::from_secs(90))));
        assert!(metrics.record_migration_completion("m-2", "Failed", &labels(), None));

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(
            r#"forklift_migrations_status_total{mode="cold",provider="vsphere",status="Succeeded",target="Local"} 1"#
        ));
        assert!(text.contains("forklift_migration_duration_seconds_count"));
    }

    #[test]
    fn test_plan_counted_once_per_status() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_plan_status("p-1", "Ready", &labels()));
        assert!(!metrics.record_plan_status("p-1", "Ready", &labels()));
        assert!(metrics.record_plan_status("p-1", "Succeeded", &labels()));
    }

    #[test]
    fn test_transferred_bytes_from_mebibytes() {
        let metrics = Metrics::new().unwrap();
        metrics.set_data_transferred("ns", "plan-a", 3);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"forklift_migration_data_transferred_bytes{namespace="ns",plan="plan-a"} 3145728"#));
    }
}
