//! Git source-control adapter.
//!
//! Runs the `git` binary against a managed clone of the application
//! repository. The sync sequence deliberately starts by discarding local
//! modifications — the clone is a build workspace, not a place where edits
//! may live — and ends with a gc pass so long-running deploy hosts don't
//! accumulate stale refs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{self, DEFAULT_COMMAND_TIMEOUT};
use crate::{AdapterError, AdapterResult, CommitInfo, RepoStatus, SourceControl, SyncReport, SyncStatistics};

/// Adapter over a local git clone.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo_path: PathBuf,
    remote: String,
}

impl GitWorkspace {
    pub fn new(repo_path: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote: remote.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn git(&self, args: &[&str]) -> AdapterResult<command::CmdOutput> {
        command::run("git", args, Some(&self.repo_path), DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn current_branch(&self) -> AdapterResult<String> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.stdout_trimmed())
    }

    /// The upstream ref of `branch`, or None if it has none.
    async fn upstream_of(&self, branch: &str) -> Option<String> {
        let upstream_arg = format!("{branch}@{{upstream}}");
        match self.git(&["rev-parse", "--abbrev-ref", &upstream_arg]).await {
            Ok(out) => {
                let name = out.stdout_trimmed();
                (!name.is_empty()).then_some(name)
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl SourceControl for GitWorkspace {
    async fn branches(&self) -> AdapterResult<Vec<String>> {
        let out = self
            .git(&["branch", "-r", "--format=%(refname:short)"])
            .await?;
        let prefix = format!("{}/", self.remote);
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_prefix(&prefix).unwrap_or(line).to_string())
            .filter(|branch| branch != "HEAD")
            .collect())
    }

    async fn commits(&self, branch: &str, limit: usize) -> AdapterResult<Vec<CommitInfo>> {
        let git_ref = format!("{}/{branch}", self.remote);
        let limit_arg = limit.to_string();
        let out = self
            .git(&[
                "log",
                &git_ref,
                "--format=%H|%s|%an|%ae|%aI",
                "-n",
                &limit_arg,
            ])
            .await?;

        let mut commits = Vec::new();
        for line in out.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.splitn(5, '|');
            let (Some(hash), Some(message), Some(author), Some(email), Some(date)) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                return Err(AdapterError::Parse {
                    program: "git".to_string(),
                    detail: format!("malformed log line: {line}"),
                });
            };
            commits.push(CommitInfo {
                hash: hash.trim().to_string(),
                message: message.trim().to_string(),
                author: author.trim().to_string(),
                email: email.trim().to_string(),
                date: date.trim().to_string(),
            });
        }
        Ok(commits)
    }

    async fn repo_status(&self) -> AdapterResult<RepoStatus> {
        let status = self.git(&["status", "--porcelain"]).await?;
        let branch_info = self.git(&["branch", "-vv"]).await?;
        let last_commit = self
            .git(&["log", "-1", "--format=%H %s %an %ad", "--date=short"])
            .await?;

        let uncommitted_files: Vec<String> = status
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(RepoStatus {
            is_clean: uncommitted_files.is_empty(),
            uncommitted_files,
            branch_info: branch_info.stdout_trimmed(),
            last_commit: last_commit.stdout_trimmed(),
        })
    }

    async fn discard_local_changes(&self) -> AdapterResult<Vec<String>> {
        let status = self.git(&["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            debug!("working tree already clean");
            return Ok(vec!["No local changes to clean".to_string()]);
        }

        let mut steps = Vec::new();
        self.git(&["checkout", "--", "."]).await?;
        steps.push("Discarded unstaged changes".to_string());
        self.git(&["clean", "-fd"]).await?;
        steps.push("Removed untracked files".to_string());
        self.git(&["reset", "--hard", "HEAD"]).await?;
        steps.push("Reset staged changes".to_string());

        info!("cleaned dirty working tree");
        Ok(steps)
    }

    async fn sync_all(&self) -> AdapterResult<SyncReport> {
        let started = Instant::now();
        let mut steps = self.discard_local_changes().await?;

        self.git(&["fetch", "--all", "--tags", "--prune"]).await?;
        steps.push("Fetched all remote branches and tags".to_string());

        let branch = self.current_branch().await?;
        steps.push(format!("Current branch: {branch}"));

        // Pull only when the branch tracks an upstream; a detached HEAD
        // (the normal state after a commit checkout) has nothing to pull.
        if self.upstream_of(&branch).await.is_some() {
            self.git(&["pull", &self.remote, &branch]).await?;
            steps.push(format!("Updated current branch: {branch}"));
        } else {
            steps.push(format!("No upstream branch for {branch}"));
        }

        self.git(&["remote", "update", &self.remote, "--prune"])
            .await?;
        steps.push("Updated remote tracking information".to_string());

        self.git(&["gc", "--prune=now"]).await?;
        steps.push("Cleaned up stale references".to_string());

        let branch_list = self.git(&["branch", "-r"]).await?;
        let total_branches = branch_list
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();

        let commit_count = self.git(&["rev-list", "--all", "--count"]).await?;
        let total_commits = commit_count
            .stdout_trimmed()
            .parse::<usize>()
            .map_err(|_| AdapterError::Parse {
                program: "git".to_string(),
                detail: format!("rev-list count: {:?}", commit_count.stdout_trimmed()),
            })?;

        let report = SyncReport {
            steps,
            statistics: SyncStatistics {
                total_branches,
                total_commits,
                duration_secs: started.elapsed().as_secs(),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        };
        info!(
            branches = report.statistics.total_branches,
            commits = report.statistics.total_commits,
            "repository sync complete"
        );
        Ok(report)
    }

    async fn checkout(&self, commit: &str) -> AdapterResult<()> {
        self.git(&["checkout", commit]).await?;
        info!(commit, "checked out commit");
        Ok(())
    }
}

impl GitWorkspace {
    /// The commit currently checked out.
    pub async fn current_commit(&self) -> AdapterResult<CommitInfo> {
        let out = self
            .git(&["log", "-1", "--format=%H|%s|%an|%ae|%aI"])
            .await?;
        let line = out.stdout_trimmed();
        let mut parts = line.splitn(5, '|');
        let (Some(hash), Some(message), Some(author), Some(email), Some(date)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(AdapterError::Parse {
                program: "git".to_string(),
                detail: format!("malformed log line: {line}"),
            });
        };
        Ok(CommitInfo {
            hash: hash.to_string(),
            message: message.to_string(),
            author: author.to_string(),
            email: email.to_string(),
            date: date.to_string(),
        })
    }
}

// Integration-style tests that build a scratch repository on disk and run
// the real git binary against it.
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn sh(dir: &Path, args: &[&str]) {
        command::run("git", args, Some(dir), Duration::from_secs(30))
            .await
            .unwrap();
    }

    async fn scratch_repo() -> (tempfile::TempDir, GitWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        sh(&path, &["init", "-b", "main"]).await;
        sh(&path, &["config", "user.email", "ci@example.com"]).await;
        sh(&path, &["config", "user.name", "CI"]).await;
        std::fs::write(path.join("app.txt"), "v1\n").unwrap();
        sh(&path, &["add", "."]).await;
        sh(&path, &["commit", "-m", "initial commit"]).await;
        (dir, GitWorkspace::new(path, "origin"))
    }

    #[tokio::test]
    async fn discard_cleans_dirty_tree() {
        let (_dir, repo) = scratch_repo().await;
        std::fs::write(repo.repo_path().join("app.txt"), "dirty\n").unwrap();
        std::fs::write(repo.repo_path().join("untracked.txt"), "x\n").unwrap();

        let steps = repo.discard_local_changes().await.unwrap();
        assert_eq!(steps.len(), 3);

        let status = repo.repo_status().await.unwrap();
        assert!(status.is_clean);
        assert!(!repo.repo_path().join("untracked.txt").exists());
    }

    #[tokio::test]
    async fn discard_on_clean_tree_is_noop() {
        let (_dir, repo) = scratch_repo().await;
        let steps = repo.discard_local_changes().await.unwrap();
        assert_eq!(steps, vec!["No local changes to clean".to_string()]);
    }

    #[tokio::test]
    async fn checkout_moves_head_to_commit() {
        let (_dir, repo) = scratch_repo().await;
        let first = repo.current_commit().await.unwrap();

        std::fs::write(repo.repo_path().join("app.txt"), "v2\n").unwrap();
        sh(repo.repo_path(), &["add", "."]).await;
        sh(repo.repo_path(), &["commit", "-m", "second commit"]).await;

        repo.checkout(&first.hash).await.unwrap();
        let current = repo.current_commit().await.unwrap();
        assert_eq!(current.hash, first.hash);
        assert_eq!(current.message, "initial commit");
    }

    #[tokio::test]
    async fn checkout_unknown_commit_fails() {
        let (_dir, repo) = scratch_repo().await;
        let err = repo.checkout("0000000000000000000000000000000000000000").await;
        assert!(matches!(err, Err(AdapterError::Command { .. })));
    }

    #[tokio::test]
    async fn status_reports_dirty_files() {
        let (_dir, repo) = scratch_repo().await;
        std::fs::write(repo.repo_path().join("new.txt"), "x\n").unwrap();

        let status = repo.repo_status().await.unwrap();
        assert!(!status.is_clean);
        assert_eq!(status.uncommitted_files.len(), 1);
        assert!(status.last_commit.contains("initial commit"));
    }
}
