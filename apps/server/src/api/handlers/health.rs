//! Liveness probe

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// GET /health
///
/// Never touches the FHIR server or the auth layer.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
