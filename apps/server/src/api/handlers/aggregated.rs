//! Aggregated immunization counts

use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// GET /aggregated-data
///
/// Serves the cached rows, recomputing first when they are older than the configured
/// interval. Upstream failures shrink the result; this handler always answers 200.
pub async fn aggregated_data(State(state): State<AppState>) -> Response {
    let cached = state.cache.get().await;
    tracing::debug!(rows = cached.rows.len(), "Serving aggregated data");
    (StatusCode::OK, Json(cached.rows.as_ref())).into_response()
}
