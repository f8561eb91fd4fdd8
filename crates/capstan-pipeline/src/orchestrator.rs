//! The pipeline orchestrator state machine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use capstan_adapters::{ArtifactBuilder, ClusterTarget, SourceControl, SyncReport};
use capstan_state::{
    AcquireOutcome, DeploymentRecord, DeploymentStatus, Initiator, OperationKind, RecordSpec,
    StateStore, now_millis,
};

use crate::{PipelineError, PipelineResult};

/// How many uniquely-tagged images survive the post-deploy cleanup.
pub const DEFAULT_KEEP_IMAGES: usize = 5;

/// A validated request to release one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub branch: String,
    pub commit: String,
    pub message: Option<String>,
    pub author: Option<String>,
    pub initiator: Initiator,
}

/// Accepted release: the record exists and the pipeline is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedRelease {
    pub deployment_id: String,
    pub record: DeploymentRecord,
}

/// Which pipeline step failed, for record bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Checkout,
    Build,
    Deploy,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Build => "build",
            Self::Deploy => "deploy",
        }
    }
}

/// Drives release pipelines and repository syncs under operation leases.
///
/// Cheap to clone; adapters are shared behind `Arc` and the store is an
/// `Arc<Database>` internally. There is no cancellation: once a run
/// starts it proceeds to a terminal state. Lease expiry lets a *new* run
/// start but does not stop a stale one — the record guards (terminal
/// immutability, forward-only status) bound what a stale task can still
/// do.
#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    source: Arc<dyn SourceControl>,
    builder: Arc<dyn ArtifactBuilder>,
    cluster: Arc<dyn ClusterTarget>,
    keep_images: usize,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        source: Arc<dyn SourceControl>,
        builder: Arc<dyn ArtifactBuilder>,
        cluster: Arc<dyn ClusterTarget>,
    ) -> Self {
        Self {
            store,
            source,
            builder,
            cluster,
            keep_images: DEFAULT_KEEP_IMAGES,
        }
    }

    /// Override how many old images the cleanup step keeps.
    pub fn with_keep_images(mut self, keep: usize) -> Self {
        self.keep_images = keep;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn SourceControl> {
        &self.source
    }

    /// Accept a release request: validate, take the release lease, persist
    /// the initial record, and hand the run to a detached background task.
    ///
    /// Returns immediately with the record id; the outcome is observable
    /// only by polling. A lease conflict creates no record.
    pub async fn start_release(&self, req: ReleaseRequest) -> PipelineResult<StartedRelease> {
        if req.branch.trim().is_empty() || req.commit.trim().is_empty() {
            return Err(PipelineError::Validation(
                "branch and commit are required".to_string(),
            ));
        }

        let initiator = req.initiator.clone();
        match self
            .store
            .acquire_lease(OperationKind::Release, &initiator.id, &initiator.label)?
        {
            AcquireOutcome::Conflict {
                owner_label,
                acquired_at,
            } => Err(PipelineError::LeaseConflict {
                holder: owner_label,
                since: acquired_at,
            }),
            AcquireOutcome::Acquired(_) => {
                let record = match self.store.create_record(RecordSpec {
                    branch: req.branch,
                    commit: req.commit,
                    message: req
                        .message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "No commit message".to_string()),
                    author: req
                        .author
                        .filter(|a| !a.trim().is_empty())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    initiator: initiator.clone(),
                }) {
                    Ok(record) => record,
                    Err(e) => {
                        // The run never started; give the lease back.
                        if let Err(release_err) =
                            self.store.release_lease(OperationKind::Release, &initiator.id)
                        {
                            error!(error = %release_err, "failed to release lease after create failure");
                        }
                        return Err(e.into());
                    }
                };

                info!(
                    deployment = %record.id,
                    branch = %record.branch,
                    commit = %record.commit,
                    initiator = %initiator.label,
                    "release accepted"
                );

                let this = self.clone();
                let id = record.id.clone();
                let owner_id = initiator.id.clone();
                tokio::spawn(async move {
                    this.run_pipeline(&id, &owner_id).await;
                });

                Ok(StartedRelease {
                    deployment_id: record.id.clone(),
                    record,
                })
            }
        }
    }

    /// Sync the repository under the sync lease. Runs synchronously — the
    /// caller gets the report — and releases the lease on every path.
    pub async fn start_sync(&self, initiator: &Initiator) -> PipelineResult<SyncReport> {
        match self
            .store
            .acquire_lease(OperationKind::Sync, &initiator.id, &initiator.label)?
        {
            AcquireOutcome::Conflict {
                owner_label,
                acquired_at,
            } => Err(PipelineError::LeaseConflict {
                holder: owner_label,
                since: acquired_at,
            }),
            AcquireOutcome::Acquired(_) => {
                info!(initiator = %initiator.label, "code sync started");
                let result = self.source.sync_all().await;
                if let Err(e) = self.store.release_lease(OperationKind::Sync, &initiator.id) {
                    error!(error = %e, "failed to release sync lease");
                }
                match result {
                    Ok(report) => {
                        info!(
                            branches = report.statistics.total_branches,
                            "code sync finished"
                        );
                        Ok(report)
                    }
                    Err(e) => {
                        warn!(error = %e, "code sync failed");
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// The detached pipeline run. Never returns an error: failures land on
    /// the record, and the lease is released regardless of outcome.
    async fn run_pipeline(&self, id: &str, owner_id: &str) {
        if let Err(e) = self.drive(id).await {
            // Terminal failure bookkeeping. If even this fails (store
            // down, record already terminal), there is nothing left to do
            // but log.
            error!(deployment = %id, error = %e, "pipeline run aborted");
        }

        // Always release the release lease; failure here is logged only.
        match self.store.release_lease(OperationKind::Release, owner_id) {
            Ok(true) => info!(deployment = %id, "release lease released"),
            Ok(false) => warn!(deployment = %id, "release lease was no longer held"),
            Err(e) => error!(deployment = %id, error = %e, "failed to release lease"),
        }
    }

    /// Run the three steps in order, then best-effort cleanup, then
    /// finalize. Any step failure finalizes the record as failed and
    /// stops; steps after the failing one stay pending.
    async fn drive(&self, id: &str) -> PipelineResult<()> {
        // ── Checkout ───────────────────────────────────────────────
        let record = self.store.get_record(id)?.ok_or_else(|| {
            PipelineError::State(capstan_state::StateError::NotFound(id.to_string()))
        })?;
        let commit = record.commit.clone();
        let branch = record.branch.clone();

        self.store.update_record(id, |r| {
            r.status = DeploymentStatus::Syncing;
            r.steps.checkout.start(now_millis());
            r.logs
                .push("Syncing repository and cleaning working tree".to_string());
        })?;

        let sync = match self.source.sync_all().await {
            Ok(report) => report,
            Err(e) => return self.finalize_failure(id, Step::Checkout, &e.to_string()),
        };
        if let Err(e) = self.source.checkout(&commit).await {
            return self.finalize_failure(id, Step::Checkout, &e.to_string());
        }

        let short = commit.chars().take(7).collect::<String>();
        self.store.update_record(id, |r| {
            for step in &sync.steps {
                r.logs.push(step.clone());
            }
            r.logs
                .push(format!("Updated {} branches", sync.statistics.total_branches));
            r.logs.push(format!("Checked out commit {short}"));
            r.steps.checkout.complete(now_millis());
        })?;

        // ── Build ──────────────────────────────────────────────────
        self.store.update_record(id, |r| {
            r.status = DeploymentStatus::Building;
            r.steps.build.start(now_millis());
            r.logs.push("Building release image".to_string());
        })?;

        let artifact = match self.builder.build(&commit, &branch, id).await {
            Ok(artifact) => artifact,
            Err(e) => return self.finalize_failure(id, Step::Build, &e.to_string()),
        };

        self.store.update_record(id, |r| {
            r.logs
                .push(format!("Image built: {}", artifact.image_tag));
            r.logs.push(format!("Image size: {}", artifact.image_size));
            r.artifact_info = Some(artifact.clone());
            r.steps.build.complete(now_millis());
        })?;

        // ── Deploy ─────────────────────────────────────────────────
        self.store.update_record(id, |r| {
            r.status = DeploymentStatus::Deploying;
            r.steps.deploy.start(now_millis());
            r.logs
                .push("Patching release manifest and rolling out".to_string());
        })?;

        let rollout = match self
            .cluster
            .deploy(&artifact.image_tag, &branch, &commit, id)
            .await
        {
            Ok(rollout) => rollout,
            Err(e) => return self.finalize_failure(id, Step::Deploy, &e.to_string()),
        };

        self.store.update_record(id, |r| {
            for step in &rollout.steps {
                r.logs.push(step.clone());
            }
            r.rollout_info = Some(rollout.clone());
        })?;

        // ── Cleanup (best effort, never fatal) ─────────────────────
        match self.builder.prune_old(self.keep_images).await {
            Ok(report) if !report.removed.is_empty() => {
                let count = report.removed.len();
                self.store.update_record(id, |r| {
                    r.logs.push(format!("Cleaned up {count} old images"));
                })?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(deployment = %id, error = %e, "image cleanup skipped");
                self.store.update_record(id, |r| {
                    r.logs
                        .push("Image cleanup skipped (non-critical)".to_string());
                })?;
            }
        }

        // ── Finalize success ───────────────────────────────────────
        self.store.update_record(id, |r| {
            let now = now_millis();
            r.status = DeploymentStatus::Deployed;
            r.steps.deploy.complete(now);
            r.completed_at = Some(now);
            r.logs.push("Release completed successfully".to_string());
        })?;
        info!(deployment = %id, "release deployed");
        Ok(())
    }

    /// Mark the failing step and drive the record to its terminal failed
    /// state. Steps after the failing one are left pending.
    fn finalize_failure(&self, id: &str, step: Step, message: &str) -> PipelineResult<()> {
        error!(deployment = %id, step = step.name(), message, "pipeline step failed");
        self.store.update_record(id, |r| {
            let now = now_millis();
            let state = match step {
                Step::Checkout => &mut r.steps.checkout,
                Step::Build => &mut r.steps.build,
                Step::Deploy => &mut r.steps.deploy,
            };
            state.fail(now);
            r.status = DeploymentStatus::Failed;
            r.error = Some(message.to_string());
            r.failed_at = Some(now);
            r.logs
                .push(format!("Release failed during {}: {message}", step.name()));
        })?;
        Ok(())
    }
}
