//! Repository browsing handlers.
//!
//! Read-only passthroughs to the source-control adapter so operators can
//! pick a branch and commit before starting a release.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// GET /api/v1/repo/branches
pub async fn list_branches(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.source().branches().await {
        Ok(branches) => ApiResponse::ok(branches).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response(),
    }
}

/// Query parameters for listing commits.
#[derive(Deserialize)]
pub struct CommitsQuery {
    pub branch: String,
    pub limit: Option<usize>,
}

/// GET /api/v1/repo/commits?branch=&limit=
pub async fn list_commits(
    State(state): State<ApiState>,
    Query(query): Query<CommitsQuery>,
) -> impl IntoResponse {
    if query.branch.trim().is_empty() {
        return error_response("branch is required", StatusCode::BAD_REQUEST).into_response();
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.orchestrator.source().commits(&query.branch, limit).await {
        Ok(commits) => ApiResponse::ok(commits).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response(),
    }
}

/// GET /api/v1/repo/status
pub async fn repo_status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.source().repo_status().await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response(),
    }
}
