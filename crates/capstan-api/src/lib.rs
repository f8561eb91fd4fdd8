//! capstan-api — REST API for Capstan.
//!
//! Provides axum route handlers for starting releases and syncs, polling
//! deployment records, and browsing the managed repository.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/releases` | Start a release pipeline |
//! | POST | `/api/v1/sync` | Sync the managed repository |
//! | GET | `/api/v1/deployments` | List deployment records |
//! | GET | `/api/v1/deployments/latest` | Latest successful deployment |
//! | GET | `/api/v1/deployments/{id}` | Poll one deployment record |
//! | GET | `/api/v1/operations/status` | Lease state of both operations |
//! | GET | `/api/v1/repo/branches` | List repository branches |
//! | GET | `/api/v1/repo/commits` | List commits on a branch |
//! | GET | `/api/v1/repo/status` | Working-tree status |

pub mod handlers;
pub mod repo_handlers;

#[cfg(test)]
mod test_support;

use axum::Router;
use axum::routing::{get, post};
use capstan_pipeline::{Orchestrator, ProgressReporter};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub reporter: ProgressReporter,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let reporter = ProgressReporter::new(orchestrator.store().clone());
        Self {
            orchestrator,
            reporter,
        }
    }
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let state = ApiState::new(orchestrator);

    let api_routes = Router::new()
        .route("/releases", post(handlers::start_release))
        .route("/sync", post(handlers::start_sync))
        .route("/deployments", get(handlers::list_deployments))
        .route("/deployments/latest", get(handlers::latest_deployment))
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/operations/status", get(handlers::operation_status))
        .route("/repo/branches", get(repo_handlers::list_branches))
        .route("/repo/commits", get(repo_handlers::list_commits))
        .route("/repo/status", get(repo_handlers::repo_status))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
