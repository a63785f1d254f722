// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Operational endpoints (health, ping, status), the configured symbol list,
// and read access to persisted candles. The subscriber WebSocket is mounted
// on the same router at `/ws`.
//
// CORS is permissive: the browser dashboard is served from another origin.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::app_state::AppState;
use crate::types::Candle;

type ApiError = (StatusCode, Json<serde_json::Value>);

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Operational ─────────────────────────────────────────────
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/status", get(status))
        // ── Market data ─────────────────────────────────────────────
        .route("/symbols", get(symbols))
        .route("/stocks-history", get(stocks_history))
        .route("/stocks-candles", get(stocks_candles))
        // ── Live subscriber feed ────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn store_error(e: anyhow::Error) -> ApiError {
    error!(error = %e, "candle store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "failed to retrieve candles" })),
    )
}

// =============================================================================
// Operational
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    time: String,
    feed_connected: bool,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        time: Utc::now().to_rfc3339(),
        feed_connected: state.feed.is_connected(),
        uptime_secs: state.uptime_secs(),
    })
}

async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({ "pong": Utc::now().to_rfc3339() }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status())
}

// =============================================================================
// Market data
// =============================================================================

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.symbols.clone())
}

async fn stocks_history(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, Vec<Candle>>>, ApiError> {
    state.store.query_all().await.map(Json).map_err(store_error)
}

#[derive(Deserialize)]
struct CandlesQuery {
    symbol: Option<String>,
}

async fn stocks_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandlesQuery>,
) -> Result<Json<Vec<Candle>>, ApiError> {
    let symbol = query
        .symbol
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "symbol parameter is required" })),
            )
        })?;

    state
        .store
        .query_by_symbol(&symbol)
        .await
        .map(Json)
        .map_err(store_error)
}
