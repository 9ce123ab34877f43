//! Prometheus scrape endpoint

use crate::{metrics::METRICS, state::AppState, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    METRICS.observe_patient_cache(state.resolver.stats());
    let body = METRICS.render()?;

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(response)
}
