//! Liveness, readiness and metrics endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use common::{HealthCheck, ping_all};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

/// Dependencies gating readiness.
#[derive(Clone)]
pub struct Readiness {
    pub checks: Vec<Arc<dyn HealthCheck>>,
    pub timeout: Duration,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: Vec<CheckResponse>,
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub name: &'static str,
    pub healthy: bool,
}

/// GET /health: the process is up.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready: 200 when every dependency answers, 503 otherwise.
#[tracing::instrument(skip(readiness))]
pub async fn ready(State(readiness): State<Readiness>) -> impl IntoResponse {
    let results = ping_all(&readiness.checks, readiness.timeout).await;
    let ready = results.iter().all(|(_, healthy)| *healthy);
    metrics::gauge!("saga_host_ready").set(if ready { 1.0 } else { 0.0 });

    let checks = results
        .into_iter()
        .map(|(name, healthy)| {
            if !healthy {
                tracing::warn!(dependency = name, "readiness check failed");
            }
            CheckResponse { name, healthy }
        })
        .collect();

    let (status, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        status,
        Json(ReadinessResponse {
            status: label,
            checks,
        }),
    )
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
