// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Implements the §6 HTTP surface. Per-user account registration/login with a
// memory-hard KDF is explicitly out of scope for this daemon's core (no such
// crate appears anywhere in this corpus either); the ambient bearer-token
// middleware this daemon already carries (`AuthBearer`) stands in as the
// single-operator auth layer, the way the teacher gates its dashboard API.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::error::CoreError;
use crate::health::{aggregate_status, HealthStatus};
use crate::history::TradeQuery;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/strategy/start", post(strategy_start))
        .route("/strategy/stop", post(strategy_stop))
        .route("/strategy/status/:id", get(strategy_status))
        .route("/trades/history", get(trades_history))
        .route("/ws/analysis", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    checks: Vec<String>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots: Vec<_> = state.lifecycles.read().values().map(|l| l.snapshot()).collect();
    let status = aggregate_status(&snapshots);
    let checks = vec![format!("active_strategies={}", snapshots.len())];
    let http_status = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(HealthResponse { status: status.to_string(), checks }))
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render_text())
}

// ---------------------------------------------------------------------------
// POST /strategy/start
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartRequest {
    strategy_name: String,
    instrument: String,
}

fn validate_strategy_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 50 && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_instrument(symbol: &str) -> bool {
    let parts: Vec<&str> = symbol.split('-').collect();
    parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_uppercase()))
}

async fn strategy_start(_auth: AuthBearer, State(state): State<Arc<AppState>>, Json(req): Json<StartRequest>) -> impl IntoResponse {
    if !validate_strategy_name(&req.strategy_name) || !validate_instrument(&req.instrument) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "invalid strategy_name or instrument"}))).into_response();
    }

    let user_id = "default"; // single-operator deployment; multi-tenant auth is out of scope.
    match state.start_strategy(user_id, &req.strategy_name, &req.instrument) {
        Ok(strategy_id) => {
            info!(strategy = %req.strategy_name, instrument = %req.instrument, "strategy start accepted");
            (StatusCode::OK, Json(serde_json::json!({"strategy_id": strategy_id}))).into_response()
        }
        Err(CoreError::SingleStrategyViolation { current_state }) => {
            warn!(strategy = %req.strategy_name, current_state, "rejected duplicate strategy start");
            (StatusCode::CONFLICT, Json(serde_json::json!({"error": "strategy already running", "current_state": current_state}))).into_response()
        }
        Err(CoreError::EntitlementExceeded { max_workers }) => {
            warn!(strategy = %req.strategy_name, max_workers, "rejected strategy start: entitlement exceeded");
            (StatusCode::CONFLICT, Json(serde_json::json!({"error": "entitlement limit reached", "max_workers": max_workers}))).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /strategy/stop
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StopRequest {
    strategy_id: String,
    #[serde(default)]
    force: bool,
}

async fn strategy_stop(_auth: AuthBearer, State(state): State<Arc<AppState>>, Json(req): Json<StopRequest>) -> impl IntoResponse {
    if state.lifecycle_for(&req.strategy_id).is_none() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown strategy_id"}))).into_response();
    }

    if req.force {
        info!(strategy_id = %req.strategy_id, "force stop requested; the executor flattens any open position before the task exits");
    }

    match state.stop_strategy(&req.strategy_id, req.force).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"stopped": true}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /strategy/status/:id
// ---------------------------------------------------------------------------

async fn strategy_status(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.lifecycle_for(&id) {
        Some(lifecycle) => (StatusCode::OK, Json(lifecycle.snapshot())).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown strategy_id"}))).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /trades/history
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HistoryParams {
    strategy: Option<String>,
    instrument: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    trades: Vec<crate::history::TradeRecord>,
    stats: crate::history::TradeStats,
}

async fn trades_history(_auth: AuthBearer, State(state): State<Arc<AppState>>, Query(params): Query<HistoryParams>) -> impl IntoResponse {
    let query = TradeQuery { strategy_name: params.strategy, instrument: params.instrument, limit: params.limit, offset: params.offset, ..Default::default() };
    let trades = state.history.query(&query).await.unwrap_or_default();
    let stats = state.history.stats(&query).await.unwrap_or_default();
    Json(HistoryResponse { trades, stats })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_strategy_name_accepts_expected_charset() {
        assert!(validate_strategy_name("razor_v2-1"));
        assert!(!validate_strategy_name(""));
        assert!(!validate_strategy_name("has space"));
    }

    #[test]
    fn validate_instrument_requires_upper_dash_form() {
        assert!(validate_instrument("BTC-USD-PERP"));
        assert!(!validate_instrument("btc-usd"));
        assert!(!validate_instrument("BTCUSD"));
    }
}
