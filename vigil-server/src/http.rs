//! HTTP endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::{AppDiagnostics, AppState};
use crate::storage::{ModerationStats, StoredUtterance};
use crate::websocket::ws_handler;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:client_id", get(ws_handler))
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/utterances", get(recent_utterances))
        .route("/api/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "mode": state.engine.mode(),
        "capture": state.settings.capture,
        "sttBackend": state.settings.stt_backend,
        "sessions": state.engine.registry().len(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.engine.sessions();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn diagnostics(State(state): State<AppState>) -> Json<AppDiagnostics> {
    Json(state.diagnostics_snapshot())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_utterances(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<StoredUtterance>>, StatusCode> {
    let store = state.store.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    store
        .recent(query.limit.unwrap_or(50))
        .map(Json)
        .map_err(|e| {
            tracing::warn!(error = %e, "utterance query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsQuery {
    range_days: Option<usize>,
}

async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ModerationStats>, StatusCode> {
    let store = state.store.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    store.stats(query.range_days.unwrap_or(7)).map(Json).map_err(|e| {
        tracing::warn!(error = %e, "stats query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
