// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/api/v1/health` requires no
// authentication. Every other endpoint requires a valid Bearer token checked
// via the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::TradingMode;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/:code", get(position_detail))
        .route("/api/v1/trade-log", get(trade_log))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions: Vec<_> = state.positions.read().values().cloned().collect();
    Json(positions)
}

async fn position_detail(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    match state.positions.read().get(&code).cloned() {
        Some(p) => Json(p).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "no such position" }))).into_response(),
    }
}

async fn trade_log(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_trade_logs.read().clone())
}

async fn errors(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors.read().clone())
}

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.trading_mode.write() = TradingMode::Paused;
    state.cache.set("trading:paused", &true, None).await;
    state.increment_version();
    info!("trading paused via API");
    Json(ControlResponse { trading_mode: "Paused".to_string(), message: "trading paused".to_string() })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.trading_mode.write() = TradingMode::Live;
    state.cache.del("trading:paused").await;
    state.cache.del("trading:stopped").await;
    state.increment_version();
    info!("trading resumed via API");
    Json(ControlResponse { trading_mode: "Live".to_string(), message: "trading resumed".to_string() })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.trading_mode.write() = TradingMode::Killed;
    state.cache.set("trading:stopped", &true, None).await;
    state.increment_version();
    warn!("trading killed via API — manual restart required");
    Json(ControlResponse {
        trading_mode: "Killed".to_string(),
        message: "trading killed — manual restart required".to_string(),
    })
}

async fn heartbeat(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.last_ws_user_event.write() = std::time::Instant::now();
    state.increment_version();
    Json(serde_json::json!({ "status": "ok", "server_time": chrono::Utc::now().timestamp_millis() }))
}
