//! Probe and metrics endpoints
//!
//! - `/healthz`: liveness; 503 only once some component is unhealthy
//! - `/readyz`: 503 until the controller runs, or while a critical loop is unhealthy
//! - `/metrics`: Prometheus text exposition of the controller's own registry

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use controller_lib::{ComponentStatus, ControllerMetrics, HealthRegistry};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    /// Registry served on `/metrics`; the same handle the controller records into
    pub metrics: ControllerMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: ControllerMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn probe_code(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    let code = probe_code(health.status != ComponentStatus::Unhealthy);
    (code, Json(health)).into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    (probe_code(readiness.ready), Json(readiness)).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&state.metrics.gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Serving probes and metrics");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
