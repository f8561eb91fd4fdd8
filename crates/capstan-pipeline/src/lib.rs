//! capstan-pipeline — the release orchestration engine.
//!
//! Drives the fixed checkout → build → deploy sequence against the
//! command adapters, persisting every transition on the deployment record
//! and holding the `release` operation lease for the whole run. A start
//! request returns as soon as the record exists; the pipeline itself runs
//! on a detached tokio task that survives the originating request and
//! releases the lease no matter how the run ends.
//!
//! Mutual exclusion comes entirely from the lease store, not in-process
//! locking — multiple orchestrator instances may share one state store.

pub mod orchestrator;
pub mod reporter;

use thiserror::Error;

use capstan_state::StateError;

pub use orchestrator::{Orchestrator, ReleaseRequest, StartedRelease};
pub use reporter::{OperationStatus, ProgressReporter};

/// Result type alias for orchestrator operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The start request was missing required fields.
    #[error("{0}")]
    Validation(String),

    /// Another operator already holds the lease for this operation.
    #[error("operation already in progress by {holder}")]
    LeaseConflict {
        holder: String,
        /// Epoch millis when the holder acquired the lease.
        since: u64,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Adapter(#[from] capstan_adapters::AdapterError),
}
