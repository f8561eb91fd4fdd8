//! Mock adapters and state builders shared by handler tests.

use std::sync::Arc;

use async_trait::async_trait;

use capstan_adapters::{
    AdapterError, AdapterResult, ArtifactBuilder, ClusterTarget, CommitInfo, PruneReport,
    RepoStatus, SourceControl, SyncReport, SyncStatistics,
};
use capstan_pipeline::Orchestrator;
use capstan_state::{ArtifactInfo, ClusterStatus, RolloutInfo, StateStore, now_millis};

use crate::ApiState;

/// Source adapter that answers every call successfully (or always fails
/// when `fail` is set).
struct StubSource {
    fail: bool,
}

#[async_trait]
impl SourceControl for StubSource {
    async fn branches(&self) -> AdapterResult<Vec<String>> {
        self.check()?;
        Ok(vec!["main".to_string(), "develop".to_string()])
    }

    async fn commits(&self, branch: &str, limit: usize) -> AdapterResult<Vec<CommitInfo>> {
        self.check()?;
        Ok((0..limit.min(3))
            .map(|i| CommitInfo {
                hash: format!("commit-{i}"),
                message: format!("change {i} on {branch}"),
                author: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                date: "2024-06-01T12:00:00Z".to_string(),
            })
            .collect())
    }

    async fn repo_status(&self) -> AdapterResult<RepoStatus> {
        self.check()?;
        Ok(RepoStatus {
            is_clean: true,
            uncommitted_files: Vec::new(),
            branch_info: "main".to_string(),
            last_commit: "abc123 initial".to_string(),
        })
    }

    async fn discard_local_changes(&self) -> AdapterResult<Vec<String>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn sync_all(&self) -> AdapterResult<SyncReport> {
        self.check()?;
        Ok(SyncReport {
            steps: vec!["Fetched all remotes".to_string()],
            statistics: SyncStatistics {
                total_branches: 2,
                total_commits: 40,
                duration_secs: 1,
                updated_at: "2024-06-01T12:00:00Z".to_string(),
            },
        })
    }

    async fn checkout(&self, _commit: &str) -> AdapterResult<()> {
        self.check()
    }
}

impl StubSource {
    fn check(&self) -> AdapterResult<()> {
        if self.fail {
            return Err(AdapterError::Command {
                program: "git".to_string(),
                code: Some(128),
                stderr: "remote unreachable".to_string(),
            });
        }
        Ok(())
    }
}

struct StubBuilder;

#[async_trait]
impl ArtifactBuilder for StubBuilder {
    async fn build(
        &self,
        _commit: &str,
        _branch: &str,
        deployment_id: &str,
    ) -> AdapterResult<ArtifactInfo> {
        Ok(ArtifactInfo {
            image_tag: format!("shopfront:{deployment_id}"),
            latest_tag: "shopfront:latest".to_string(),
            image_size: "210MB".to_string(),
            build_output: "Successfully built".to_string(),
            built_at: now_millis(),
        })
    }

    async fn inspect(&self, _tag: &str) -> AdapterResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn prune_old(&self, _keep: usize) -> AdapterResult<PruneReport> {
        Ok(PruneReport::default())
    }
}

struct StubCluster;

#[async_trait]
impl ClusterTarget for StubCluster {
    async fn deploy(
        &self,
        image_tag: &str,
        _branch: &str,
        _commit: &str,
        _deployment_id: &str,
    ) -> AdapterResult<RolloutInfo> {
        Ok(RolloutInfo {
            image_tag: image_tag.to_string(),
            steps: vec!["Applied release manifest".to_string()],
            rollout_output: "rolled out".to_string(),
            status: None,
            finished_at: now_millis(),
        })
    }

    async fn deployment_status(&self) -> AdapterResult<ClusterStatus> {
        Ok(ClusterStatus::default())
    }

    async fn pod_logs(&self, _lines: usize) -> AdapterResult<String> {
        Ok(String::new())
    }
}

fn state_with_source(source: StubSource) -> ApiState {
    let store = StateStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(source),
        Arc::new(StubBuilder),
        Arc::new(StubCluster),
    );
    ApiState::new(orchestrator)
}

pub(crate) fn test_state() -> ApiState {
    state_with_source(StubSource { fail: false })
}

/// State whose source adapter fails every call.
pub(crate) fn failing_state() -> ApiState {
    state_with_source(StubSource { fail: true })
}
