//! Domain types for the Capstan state store.
//!
//! These types represent the persisted state of release pipeline runs and
//! operation leases. All types are serializable to/from JSON for storage
//! in redb tables. Timestamps are Unix epoch milliseconds.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a deployment record (UUID v4).
pub type DeploymentId = String;

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Deployment records ─────────────────────────────────────────────

/// Overall pipeline status. Advances strictly forward through the success
/// path; `Failed` is reachable from any non-terminal state. `Deployed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initializing,
    Syncing,
    Building,
    Deploying,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    /// Position on the success path, used to reject backward transitions.
    pub fn rank(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Syncing => 1,
            Self::Building => 2,
            Self::Deploying => 3,
            Self::Deployed => 4,
            Self::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deployed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Syncing => "syncing",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }

    /// All known status values, in pipeline order.
    pub const ALL: [DeploymentStatus; 6] = [
        Self::Initializing,
        Self::Syncing,
        Self::Building,
        Self::Deploying,
        Self::Deployed,
        Self::Failed,
    ];
}

/// Sub-state of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One pipeline step with its timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Millis when the step entered `Running`.
    pub start_time: Option<u64>,
    /// Millis when the step reached `Completed` or `Failed`.
    pub end_time: Option<u64>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
        }
    }
}

impl StepState {
    pub fn start(&mut self, now: u64) {
        self.status = StepStatus::Running;
        self.start_time = Some(now);
    }

    pub fn complete(&mut self, now: u64) {
        self.status = StepStatus::Completed;
        self.end_time = Some(now);
    }

    pub fn fail(&mut self, now: u64) {
        self.status = StepStatus::Failed;
        self.end_time = Some(now);
    }
}

/// The fixed checkout → build → deploy step sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSteps {
    pub checkout: StepState,
    pub build: StepState,
    pub deploy: StepState,
}

/// Identity of the operator who started an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub id: String,
    pub name: String,
    /// Human-facing handle shown in conflict messages (e.g. an email).
    pub label: String,
}

/// Result of the image build step, persisted on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Unique tag for this run, `{image}:{deployment_id}`.
    pub image_tag: String,
    /// The moving alias, `{image}:latest`.
    pub latest_tag: String,
    /// Human-readable size as reported by the builder.
    pub image_size: String,
    /// Trailing excerpt (~1000 chars) of the build output.
    pub build_output: String,
    pub built_at: u64,
}

/// Result of the cluster rollout step, persisted on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutInfo {
    pub image_tag: String,
    /// Sub-steps performed against the cluster, in order.
    pub steps: Vec<String>,
    /// Output of the rollout wait.
    pub rollout_output: String,
    /// Cluster-reported deployment status after rollout.
    pub status: Option<ClusterStatus>,
    pub finished_at: u64,
}

/// Cluster deployment status snapshot (replica counts, conditions, image).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    pub updated_replicas: u32,
    pub available_replicas: u32,
    pub image: String,
    pub namespace: String,
    pub conditions: Vec<serde_json::Value>,
}

/// Input for creating a new deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSpec {
    pub branch: String,
    pub commit: String,
    pub message: String,
    pub author: String,
    pub initiator: Initiator,
}

/// One release pipeline run, from creation to terminal outcome.
///
/// Owned exclusively by the orchestrator once created; pollers only read.
/// A reader may observe a record mid-update (logs ahead of status) — no
/// cross-field atomicity is promised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub branch: String,
    pub commit: String,
    pub message: String,
    pub author: String,
    pub initiator: Initiator,
    pub status: DeploymentStatus,
    pub steps: PipelineSteps,
    /// Append-only; never truncated or reordered.
    pub logs: Vec<String>,
    pub artifact_info: Option<ArtifactInfo>,
    pub rollout_info: Option<RolloutInfo>,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub failed_at: Option<u64>,
}

impl DeploymentRecord {
    /// Build the initial record for a freshly accepted release request.
    pub fn new(spec: RecordSpec) -> Self {
        let now = now_millis();
        let first_log = format!(
            "Release initiated by {} ({})",
            spec.initiator.name, spec.initiator.label
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            branch: spec.branch,
            commit: spec.commit,
            message: spec.message,
            author: spec.author,
            initiator: spec.initiator,
            status: DeploymentStatus::Initializing,
            steps: PipelineSteps::default(),
            logs: vec![first_log],
            artifact_info: None,
            rollout_info: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        }
    }
}

// ── Listing ────────────────────────────────────────────────────────

/// Filters for listing deployment records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<DeploymentStatus>,
    pub branch: Option<String>,
    /// Case-insensitive match over commit, message, branch, and initiator
    /// name/label.
    pub search: Option<String>,
}

/// Pagination metadata for a record listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
    pub page_size: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

/// Tally of records per status over the status/branch-filtered set.
/// Every known status is present, defaulting to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub initializing: usize,
    pub syncing: usize,
    pub building: usize,
    pub deploying: usize,
    pub deployed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn bump(&mut self, status: DeploymentStatus) {
        self.total += 1;
        match status {
            DeploymentStatus::Initializing => self.initializing += 1,
            DeploymentStatus::Syncing => self.syncing += 1,
            DeploymentStatus::Building => self.building += 1,
            DeploymentStatus::Deploying => self.deploying += 1,
            DeploymentStatus::Deployed => self.deployed += 1,
            DeploymentStatus::Failed => self.failed += 1,
        }
    }
}

/// One page of deployment records plus listing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<DeploymentRecord>,
    pub pagination: Pagination,
    pub status_counts: StatusCounts,
}

// ── Operation leases ───────────────────────────────────────────────

/// The two operation kinds guarded by leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Repository code sync (fetch/pull/gc).
    Sync,
    /// Full release pipeline run.
    Release,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Release => "release",
        }
    }
}

/// A time-bounded mutual-exclusion record granting one owner exclusive
/// rights to run an operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLease {
    pub kind: OperationKind,
    pub owner_id: String,
    pub owner_label: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(OperationLease),
    /// An unexpired lease is already held by someone else.
    Conflict { owner_label: String, acquired_at: u64 },
}

/// Observable lease state for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseStatus {
    Unlocked,
    Locked {
        owner_label: String,
        acquired_at: u64,
        expires_at: u64,
    },
}
