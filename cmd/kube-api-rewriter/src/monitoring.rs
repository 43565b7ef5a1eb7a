//! Monitoring and profiling endpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Set once every proxy listener is accepting connections.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Marks the process ready.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the process is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
struct MonitoringState {
    registries: Arc<Vec<Registry>>,
    readiness: Readiness,
}

/// `/healthz`, `/readyz` and `/metrics` over the given registries.
pub fn router(registries: Vec<Registry>, readiness: Readiness) -> Router {
    let state = MonitoringState {
        registries: Arc::new(registries),
        readiness,
    };
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn readyz(State(state): State<MonitoringState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<MonitoringState>) -> Response {
    let families: Vec<_> = state.registries.iter().flat_map(Registry::gather).collect();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// `/debug/runtime`: tokio runtime counters as JSON.
pub fn profiling_router() -> Router {
    let started = Instant::now();
    Router::new()
        .route("/debug/runtime", get(move || runtime(started)))
        .layer(TraceLayer::new_for_http())
}

async fn runtime(started: Instant) -> Json<serde_json::Value> {
    let metrics = tokio::runtime::Handle::current().metrics();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": started.elapsed().as_secs(),
        "workers": metrics.num_workers(),
        "aliveTasks": metrics.num_alive_tasks(),
        "globalQueueDepth": metrics.global_queue_depth(),
    }))
}
