//! REST API handlers for releases, sync, and deployment polling.
//!
//! Each handler drives the orchestrator or reads via the reporter and
//! returns JSON responses.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::warn;

use capstan_pipeline::{PipelineError, ReleaseRequest};
use capstan_state::{DeploymentStatus, RecordFilter};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Map orchestrator errors to HTTP responses. A lease conflict becomes
/// 423 Locked with the current holder in the body.
pub(crate) fn pipeline_error_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::Validation(msg) => {
            error_response(&msg, StatusCode::BAD_REQUEST).into_response()
        }
        PipelineError::LeaseConflict { holder, since } => (
            StatusCode::LOCKED,
            Json(serde_json::json!({
                "success": false,
                "error": format!("operation already in progress by {holder}"),
                "locked_by": holder,
                "locked_at": since,
            })),
        )
            .into_response(),
        PipelineError::State(e) => {
            warn!(error = %e, "state store error");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
        PipelineError::Adapter(e) => {
            error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response()
        }
    }
}

// ── Releases ───────────────────────────────────────────────────

/// POST /api/v1/releases
///
/// Accepts the release and returns 202 immediately; the pipeline runs in
/// the background and is observable via the deployments endpoints.
pub async fn start_release(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseRequest>,
) -> impl IntoResponse {
    match state.orchestrator.start_release(req).await {
        Ok(started) => (StatusCode::ACCEPTED, ApiResponse::ok(started)).into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

// ── Sync ───────────────────────────────────────────────────────

/// Sync request body.
#[derive(Deserialize)]
pub struct SyncRequest {
    pub initiator: capstan_state::Initiator,
}

/// POST /api/v1/sync
pub async fn start_sync(
    State(state): State<ApiState>,
    Json(req): Json<SyncRequest>,
) -> impl IntoResponse {
    match state.orchestrator.start_sync(&req.initiator).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// Query parameters for listing deployment records.
#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub status: Option<String>,
    pub branch: Option<String>,
    pub search: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

fn parse_status(raw: &str) -> Option<DeploymentStatus> {
    DeploymentStatus::ALL
        .into_iter()
        .find(|s| s.as_str() == raw)
}

/// GET /api/v1/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = match &query.status {
        Some(raw) if raw != "all" => match parse_status(raw) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    &format!("unknown status `{raw}`"),
                    StatusCode::BAD_REQUEST,
                )
                .into_response();
            }
        },
        _ => None,
    };

    let filter = RecordFilter {
        status,
        branch: query.branch.filter(|b| !b.is_empty() && b != "all"),
        search: query.search.filter(|s| !s.is_empty()),
    };
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);

    match state.reporter.list(&filter, page, page_size) {
        Ok(page) => ApiResponse::ok(page).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/deployments/latest
pub async fn latest_deployment(State(state): State<ApiState>) -> impl IntoResponse {
    match state.reporter.latest_deployed() {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("no successful deployment yet", StatusCode::NOT_FOUND)
            .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.reporter.get(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Operations ─────────────────────────────────────────────────

/// GET /api/v1/operations/status
pub async fn operation_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.reporter.operation_status())
}
