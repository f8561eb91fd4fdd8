//! Docker image-builder adapter.
//!
//! Builds the application image out of the checked-out working tree,
//! tagging it `{image}:{deployment_id}` for traceability plus
//! `{image}:latest` as the moving alias the manifests may reference.
//! Pruning keeps the newest N uniquely-tagged images and never touches
//! the latest alias.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use capstan_state::{ArtifactInfo, now_millis};

use crate::command::{self, tail_chars};
use crate::{AdapterError, AdapterResult, ArtifactBuilder, PruneReport};

/// How much trailing build output to keep on the deployment record.
const BUILD_OUTPUT_EXCERPT_CHARS: usize = 1000;

/// Image builds can be slow; give them more headroom than other commands.
const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Adapter over the local `docker` daemon.
#[derive(Debug, Clone)]
pub struct DockerBuilder {
    repo_path: PathBuf,
    image: String,
    dockerfile: String,
}

impl DockerBuilder {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        image: impl Into<String>,
        dockerfile: impl Into<String>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            image: image.into(),
            dockerfile: dockerfile.into(),
        }
    }

    /// The managed image name (without tag).
    pub fn image(&self) -> &str {
        &self.image
    }

    async fn docker(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> AdapterResult<command::CmdOutput> {
        command::run("docker", args, Some(&self.repo_path), timeout).await
    }

    /// List `{tag, created_at}` pairs for the managed image.
    async fn list_tags(&self) -> AdapterResult<Vec<(String, String)>> {
        let out = self
            .docker(
                &[
                    "images",
                    &self.image,
                    "--format",
                    "{{.Tag}}\t{{.CreatedAt}}",
                ],
                command::DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;

        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let (tag, created) = line.split_once('\t')?;
                let tag = tag.trim();
                if tag.is_empty() || tag == "<none>" {
                    return None;
                }
                Some((tag.to_string(), created.trim().to_string()))
            })
            .collect())
    }
}

#[async_trait]
impl ArtifactBuilder for DockerBuilder {
    async fn build(
        &self,
        commit: &str,
        branch: &str,
        deployment_id: &str,
    ) -> AdapterResult<ArtifactInfo> {
        let image_tag = format!("{}:{deployment_id}", self.image);
        let latest_tag = format!("{}:latest", self.image);

        info!(%image_tag, commit, branch, "building image");
        let build = self
            .docker(
                &[
                    "build",
                    "-t",
                    &image_tag,
                    "-t",
                    &latest_tag,
                    "-f",
                    &self.dockerfile,
                    ".",
                ],
                BUILD_TIMEOUT,
            )
            .await?;

        // Size is informational; a failed lookup should not fail the build.
        let image_size = match self
            .docker(
                &["images", &image_tag, "--format", "{{.Size}}"],
                command::DEFAULT_COMMAND_TIMEOUT,
            )
            .await
        {
            Ok(out) => {
                let size = out.stdout_trimmed();
                if size.is_empty() { "unknown".to_string() } else { size }
            }
            Err(e) => {
                warn!(error = %e, "could not read image size");
                "unknown".to_string()
            }
        };

        Ok(ArtifactInfo {
            image_tag,
            latest_tag,
            image_size,
            build_output: tail_chars(&build.combined(), BUILD_OUTPUT_EXCERPT_CHARS),
            built_at: now_millis(),
        })
    }

    async fn inspect(&self, tag: &str) -> AdapterResult<serde_json::Value> {
        let out = self
            .docker(&["inspect", tag], command::DEFAULT_COMMAND_TIMEOUT)
            .await?;
        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&out.stdout).map_err(|e| AdapterError::Parse {
                program: "docker".to_string(),
                detail: format!("inspect output: {e}"),
            })?;
        parsed.into_iter().next().ok_or_else(|| AdapterError::Parse {
            program: "docker".to_string(),
            detail: "inspect returned an empty array".to_string(),
        })
    }

    async fn prune_old(&self, keep: usize) -> AdapterResult<PruneReport> {
        let tags = self.list_tags().await?;
        let prunable = select_prunable(&tags, keep);
        let remaining = tags.iter().filter(|(t, _)| t != "latest").count() - prunable.len();

        let mut removed = Vec::new();
        for tag in prunable {
            let full = format!("{}:{tag}", self.image);
            match self
                .docker(&["rmi", &full], command::DEFAULT_COMMAND_TIMEOUT)
                .await
            {
                Ok(_) => {
                    debug!(%full, "removed old image");
                    removed.push(tag);
                }
                // A tag may be in use by a running container; skip it.
                Err(e) => warn!(%full, error = %e, "could not remove old image"),
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "pruned old images");
        }
        Ok(PruneReport { removed, remaining })
    }
}

/// Pick the tags to delete: everything past the newest `keep`, excluding
/// the `latest` alias. `entries` are `(tag, created_at)` pairs; docker's
/// `{{.CreatedAt}}` format sorts chronologically as a string.
fn select_prunable(entries: &[(String, String)], keep: usize) -> Vec<String> {
    let mut dated: Vec<&(String, String)> = entries
        .iter()
        .filter(|(tag, _)| tag != "latest")
        .collect();
    dated.sort_by(|a, b| b.1.cmp(&a.1));
    dated
        .into_iter()
        .skip(keep)
        .map(|(tag, _)| tag.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: &str, created: &str) -> (String, String) {
        (tag.to_string(), created.to_string())
    }

    #[test]
    fn prunes_beyond_keep_never_latest() {
        // 8 tagged images plus the latest alias; keep=5 removes exactly 3.
        let mut entries: Vec<(String, String)> = (1..=8)
            .map(|i| entry(&format!("dep-{i}"), &format!("2024-03-0{i} 10:00:00")))
            .collect();
        entries.push(entry("latest", "2024-03-08 10:00:00"));

        let prunable = select_prunable(&entries, 5);
        assert_eq!(prunable.len(), 3);
        assert!(!prunable.iter().any(|t| t == "latest"));
        // The oldest three go.
        assert_eq!(prunable, vec!["dep-3", "dep-2", "dep-1"]);
    }

    #[test]
    fn fewer_than_keep_prunes_nothing() {
        let entries = vec![
            entry("dep-1", "2024-03-01 10:00:00"),
            entry("dep-2", "2024-03-02 10:00:00"),
            entry("latest", "2024-03-02 10:00:00"),
        ];
        assert!(select_prunable(&entries, 5).is_empty());
    }

    #[test]
    fn keep_zero_prunes_all_but_latest() {
        let entries = vec![
            entry("dep-1", "2024-03-01 10:00:00"),
            entry("latest", "2024-03-01 10:00:00"),
        ];
        assert_eq!(select_prunable(&entries, 0), vec!["dep-1"]);
    }

    #[test]
    fn empty_list_is_fine() {
        assert!(select_prunable(&[], 5).is_empty());
    }
}
