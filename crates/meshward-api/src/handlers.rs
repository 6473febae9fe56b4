//! Axum route handlers for the meshward REST API.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use meshward_core::epoch_secs;
use meshward_metrics::{ProbeMetricsSnapshot, render_prometheus};
use meshward_registry::ClientStats;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ApiState;
use crate::validate::{validate_address, validate_identity};

/// Standard API response envelope.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Registration ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RememberRequest {
    pub identity: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct RememberResponse {
    pub identity: String,
    pub address: String,
    pub last_seen: u64,
    pub total_clients: usize,
}

/// POST /clients/remember
pub async fn remember(
    State(state): State<ApiState>,
    Json(req): Json<RememberRequest>,
) -> impl IntoResponse {
    let identity = req.identity.trim();
    let address = req.address.trim();
    if let Err(msg) = validate_identity(identity).and_then(|()| validate_address(address)) {
        warn!(%identity, %address, reason = %msg, "rejected registration");
        return error_response(&msg, StatusCode::BAD_REQUEST).into_response();
    }

    // Write-through commit: keep it off the async workers.
    let registry = Arc::clone(&state.registry);
    let (identity, address) = (identity.to_string(), address.to_string());
    let record = match tokio::task::spawn_blocking(move || {
        registry.remember(&identity, &address, epoch_secs())
    })
    .await
    {
        Ok(record) => record,
        Err(e) => {
            error!(error = %e, "registration task failed");
            return error_response("registration failed", StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    ApiResponse::ok(RememberResponse {
        identity: record.identity,
        address: record.address,
        last_seen: record.last_seen,
        total_clients: state.registry.len(),
    })
    .into_response()
}

// ── Queries ────────────────────────────────────────────────────

/// GET /clients
pub async fn list_clients(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot())
}

/// GET /clients/active
pub async fn list_active_clients(State(state): State<ApiState>) -> impl IntoResponse {
    let stale_after = state.config.current().stale_after();
    ApiResponse::ok(state.registry.list_active_at(epoch_secs(), stale_after))
}

/// GET /clients/stats
pub async fn client_stats(State(state): State<ApiState>) -> impl IntoResponse {
    let stale_after = state.config.current().stale_after();
    ApiResponse::ok(state.registry.stats(stale_after))
}

// ── Eviction ───────────────────────────────────────────────────

/// DELETE /clients/{identity}
pub async fn forget_client(
    State(state): State<ApiState>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    match state.registry.forget(&identity) {
        Ok(true) => ApiResponse::ok("forgotten").into_response(),
        Ok(false) => error_response("client not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EvictRequest {
    pub max_age_secs: u64,
}

/// POST /clients/evict
pub async fn evict_stale(
    State(state): State<ApiState>,
    Json(req): Json<EvictRequest>,
) -> impl IntoResponse {
    let max_age = Duration::from_secs(req.max_age_secs);
    match state.registry.evict_stale(epoch_secs(), max_age) {
        Ok(evicted) => {
            info!(count = evicted.len(), ?max_age, "stale clients evicted");
            ApiResponse::ok(evicted).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// Scheduler ticking and persistence working.
    pub ok: bool,
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub scheduler_healthy: bool,
    pub last_tick_secs_ago: Option<u64>,
    pub persistence_degraded: bool,
    pub pending_writes: usize,
    pub clients: ClientStats,
    /// Probes dispatched but not yet settled.
    pub pending_probes: u64,
    /// Share of recorded probes that reached their client.
    pub probe_success_rate: f64,
    pub probes: ProbeMetricsSnapshot,
}

/// GET /health
///
/// Always 200: degraded conditions are reported in the body.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let stale_after = state.config.current().stale_after();
    let scheduler_healthy = state.scheduler.health();
    let persistence_degraded = state.registry.is_degraded();
    let probes = state.scheduler.metrics().snapshot();

    ApiResponse::ok(HealthReport {
        ok: scheduler_healthy && !persistence_degraded,
        timestamp: epoch_secs(),
        uptime_secs: state.started.elapsed().as_secs(),
        scheduler_healthy,
        last_tick_secs_ago: state.scheduler.last_tick_age().map(|d| d.as_secs()),
        persistence_degraded,
        pending_writes: state.registry.pending_writes(),
        clients: state.registry.stats(stale_after),
        pending_probes: probes.pending(),
        probe_success_rate: probes.success_rate(),
        probes,
    })
}

/// GET /config
pub async fn current_config(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.config.current())
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let stale_after = state.config.current().stale_after();
    let body = render_prometheus(
        &state.registry.stats(stale_after),
        &state.scheduler.metrics().snapshot(),
        state.started.elapsed(),
        state.scheduler.health(),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
