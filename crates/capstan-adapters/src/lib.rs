//! capstan-adapters — external command adapters for the release pipeline.
//!
//! Wraps the `git`, `docker`, and `kubectl` binaries behind object-safe
//! async traits so the orchestrator can be driven against real tools in
//! production and mocks in tests. Every invocation captures stdout and
//! stderr; non-zero exits become [`AdapterError::Command`] carrying the
//! captured output, and long-running calls are bounded by a timeout.
//!
//! The release manifest is patched structurally (parse → patch → serialize
//! via serde_yaml), never by text substitution, so unrelated manifest
//! content survives byte-for-byte at the YAML level.

pub mod command;
pub mod docker;
pub mod git;
pub mod kube;
pub mod manifest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use capstan_state::{ArtifactInfo, ClusterStatus, RolloutInfo};

/// Result type alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by external command adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("`{program}` exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{program}` timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from `{program}`: {detail}")]
    Parse { program: String, detail: String },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Source control ─────────────────────────────────────────────────

/// One commit as listed from the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub email: String,
    pub date: String,
}

/// Working-tree status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub is_clean: bool,
    pub uncommitted_files: Vec<String>,
    pub branch_info: String,
    pub last_commit: String,
}

/// Outcome of a full repository sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Sub-steps performed, in order, for operator-facing logs.
    pub steps: Vec<String>,
    pub statistics: SyncStatistics,
}

/// Repository totals gathered after a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub total_branches: usize,
    pub total_commits: usize,
    pub duration_secs: u64,
    pub updated_at: String,
}

/// Source-control operations the pipeline needs.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn branches(&self) -> AdapterResult<Vec<String>>;

    async fn commits(&self, branch: &str, limit: usize) -> AdapterResult<Vec<CommitInfo>>;

    async fn repo_status(&self) -> AdapterResult<RepoStatus>;

    /// Discard every local modification: revert tracked files, remove
    /// untracked files/directories, hard-reset to HEAD. Returns the
    /// cleanup steps taken.
    async fn discard_local_changes(&self) -> AdapterResult<Vec<String>>;

    /// Fetch/prune all remotes, pull the current branch if tracked,
    /// refresh remote-tracking metadata, and garbage-collect.
    async fn sync_all(&self) -> AdapterResult<SyncReport>;

    async fn checkout(&self, commit: &str) -> AdapterResult<()>;
}

// ── Image builder ──────────────────────────────────────────────────

/// Result of pruning old artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Tags that were removed.
    pub removed: Vec<String>,
    /// Tagged artifacts remaining (excluding the latest alias).
    pub remaining: usize,
}

/// Image build/inspect/prune operations the pipeline needs.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build an image tagged uniquely by `deployment_id` and aliased as
    /// `latest`.
    async fn build(
        &self,
        commit: &str,
        branch: &str,
        deployment_id: &str,
    ) -> AdapterResult<ArtifactInfo>;

    async fn inspect(&self, tag: &str) -> AdapterResult<serde_json::Value>;

    /// Remove artifacts beyond the newest `keep`, never the latest alias.
    async fn prune_old(&self, keep: usize) -> AdapterResult<PruneReport>;
}

// ── Cluster orchestrator ───────────────────────────────────────────

/// Cluster rollout operations the pipeline needs.
#[async_trait]
pub trait ClusterTarget: Send + Sync {
    /// Patch the release manifest to the new image, apply it (plus the
    /// optional companion config manifest), and block until the rollout
    /// reports ready or times out.
    async fn deploy(
        &self,
        image_tag: &str,
        branch: &str,
        commit: &str,
        deployment_id: &str,
    ) -> AdapterResult<RolloutInfo>;

    async fn deployment_status(&self) -> AdapterResult<ClusterStatus>;

    async fn pod_logs(&self, lines: usize) -> AdapterResult<String>;
}

pub use docker::DockerBuilder;
pub use git::GitWorkspace;
pub use kube::KubeDeployer;
