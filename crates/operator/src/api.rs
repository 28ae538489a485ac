//! Probe and scrape endpoints
//!
//! `/healthz` and `/readyz` back the operator pod's liveness and readiness
//! probes; `/metrics` serves the default Prometheus registry.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use operator_lib::{ComponentStatus, HealthRegistry, OperatorMetrics};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: OperatorMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: OperatorMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

/// JSON body with 200 when the probe passes, 503 otherwise
fn probe<T: Serialize>(passing: bool, body: T) -> Response {
    let code = if passing {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// Degraded loops are retrying on their own, so only an unhealthy one
/// fails liveness
async fn liveness(State(state): State<SharedState>) -> Response {
    let report = state.health_registry.health().await;
    probe(report.status != ComponentStatus::Unhealthy, report)
}

async fn readiness(State(state): State<SharedState>) -> Response {
    let report = state.health_registry.readiness().await;
    probe(report.ready, report)
}

async fn scrape() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(scrape))
        .with_state(state)
}

/// Serve on all interfaces until `shutdown` fires
pub async fn serve(
    port: u16,
    state: SharedState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Probe server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("Probe server stopped");
    Ok(())
}
