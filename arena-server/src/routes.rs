//! HTTP routes for job submission.

use std::sync::Arc;

use arena::submit::{Accepted, JobRequest, submit};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::Json;
use axum::routing::post;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the ingress router. Anything other than `POST /jobs` is a 404.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/jobs", post(create_job).fallback(not_found))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /jobs - validate and enqueue; returns as soon as the record is in
/// the inbox.
async fn create_job(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Accepted>, ApiError> {
    let request: JobRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))?;
    let store = Arc::clone(&state.store);
    let accepted = tokio::task::spawn_blocking(move || submit(&store, request))
        .await
        .map_err(|err| ApiError::Internal(format!("enqueue task failed: {err}")))??;
    Ok(Json(accepted))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}
