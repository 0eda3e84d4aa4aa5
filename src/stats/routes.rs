//! REST endpoints for daily statistics.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::store::traits::Database;

/// Default and maximum number of days returned by `/api/stats`.
const DEFAULT_DAYS: usize = 30;
const MAX_DAYS: usize = 365;

/// Shared state for stats routes.
#[derive(Clone)]
pub struct StatsRouteState {
    pub db: Arc<dyn Database>,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    limit: Option<usize>,
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /api/stats?limit=N
///
/// Per-day counters, most recent first.
async fn get_daily(
    State(state): State<StatsRouteState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS);
    match state.db.daily_stats(limit).await {
        Ok(days) => Json(serde_json::json!({ "days": days })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read daily stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read stats"})),
            )
                .into_response()
        }
    }
}

/// GET /api/stats/summary
async fn get_summary(State(state): State<StatsRouteState>) -> impl IntoResponse {
    match state.db.daily_stats_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read stats summary");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read stats"})),
            )
                .into_response()
        }
    }
}

/// Build the stats REST routes.
pub fn stats_routes(state: StatsRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_daily))
        .route("/api/stats/summary", get(get_summary))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
