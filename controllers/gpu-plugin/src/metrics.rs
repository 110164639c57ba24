//! Prometheus metrics and health probes
//!
//! Served by a small axum router on the metrics bind address:
//! `/metrics` (text exposition), `/healthz` (process alive) and `/readyz`
//! (resource cache holds the initial listing).

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Controller metrics registered on a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    workload_writes: IntCounterVec,
    reconcile_duration: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all controller metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("gpu_plugin_reconciliations_total", "Reconcile passes by outcome"),
            &["outcome"],
        )?;
        let workload_writes = IntCounterVec::new(
            Opts::new("gpu_plugin_workload_writes_total", "DaemonSet writes by operation"),
            &["operation"],
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "gpu_plugin_reconcile_duration_seconds",
            "Duration of a reconcile pass",
        ))?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(workload_writes.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            workload_writes,
            reconcile_duration,
        })
    }

    /// Count a finished reconcile pass
    pub fn record_reconcile(&self, outcome: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[outcome]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Count a DaemonSet create or patch
    pub fn record_workload_write(&self, operation: &str) {
        self.workload_writes.with_label_values(&[operation]).inc();
    }

    /// Passes recorded with `outcome`
    #[cfg(test)]
    pub fn reconcile_count(&self, outcome: &str) -> u64 {
        self.reconciliations.with_label_values(&[outcome]).get()
    }

    /// Render the registry in text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Readiness flag flipped once the resource cache has synced
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Mark the controller ready to serve
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether the controller is ready
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
struct ServerState {
    metrics: Arc<Metrics>,
    health: HealthState,
}

/// Router exposing metrics and probes
pub fn router(metrics: Arc<Metrics>, health: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ServerState { metrics, health })
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    if state.health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve metrics and probes until the process exits.
pub async fn serve(address: SocketAddr, metrics: Arc<Metrics>, health: HealthState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Metrics and probes listening on {}", address);
    axum::serve(listener, router(metrics, health)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exposed() {
        let metrics = Metrics::new().expect("register");
        metrics.record_reconcile("created", Duration::from_millis(12));
        metrics.record_workload_write("create");

        let text = metrics.encode().expect("encode");
        assert!(text.contains("gpu_plugin_reconciliations_total{outcome=\"created\"} 1"));
        assert!(text.contains("gpu_plugin_workload_writes_total{operation=\"create\"} 1"));
        assert!(text.contains("gpu_plugin_reconcile_duration_seconds_count 1"));
        assert_eq!(metrics.reconcile_count("created"), 1);
    }

    #[tokio::test]
    async fn test_readiness_probe_follows_health_state() {
        let metrics = Arc::new(Metrics::new().expect("register"));
        let health = HealthState::default();
        let state = ServerState {
            metrics,
            health: health.clone(),
        };

        let (status, _) = readyz(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        health.mark_ready();
        let (status, _) = readyz(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
