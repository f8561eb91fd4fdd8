//! Kubernetes cluster adapter.
//!
//! Drives `kubectl` against a single namespace: patch the release manifest
//! to the freshly built image, apply it (plus an optional companion config
//! manifest), then block until the rollout reports ready. Manifest files
//! live inside the managed repository checkout so they track the deployed
//! revision.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use capstan_state::{ClusterStatus, RolloutInfo, now_millis};

use crate::command::{self, DEFAULT_COMMAND_TIMEOUT};
use crate::manifest::{self, DeployAnnotations};
use crate::{AdapterError, AdapterResult, ClusterTarget};

/// Adapter over `kubectl` for one namespace and one managed deployment.
#[derive(Debug, Clone)]
pub struct KubeDeployer {
    namespace: String,
    repo_path: PathBuf,
    /// Release manifest, relative to the repository root.
    manifest_path: PathBuf,
    /// Optional companion ConfigMap manifest; absence is tolerated.
    config_manifest_path: Option<PathBuf>,
    deployment_name: String,
    rollout_timeout: Duration,
}

impl KubeDeployer {
    pub fn new(
        namespace: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        config_manifest_path: Option<PathBuf>,
        deployment_name: impl Into<String>,
        rollout_timeout: Duration,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            repo_path: repo_path.into(),
            manifest_path: manifest_path.into(),
            config_manifest_path,
            deployment_name: deployment_name.into(),
            rollout_timeout,
        }
    }

    async fn kubectl(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> AdapterResult<command::CmdOutput> {
        command::run("kubectl", args, Some(&self.repo_path), timeout).await
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_path.join(path)
        }
    }

    /// Patch the companion config manifest and apply it. Any failure here
    /// is reported back as a step note, never as an error.
    async fn apply_config_manifest(
        &self,
        annotations: &DeployAnnotations,
        image_tag: &str,
        steps: &mut Vec<String>,
    ) {
        let Some(path) = &self.config_manifest_path else {
            return;
        };
        let resolved = self.resolve(path);
        if !resolved.exists() {
            warn!(path = %resolved.display(), "config manifest not found, skipping");
            steps.push("Config manifest skipped (file not found)".to_string());
            return;
        }

        let result = async {
            let content = tokio::fs::read_to_string(&resolved).await?;
            let patched = manifest::patch_config_manifest(&content, annotations, image_tag)?;
            tokio::fs::write(&resolved, patched).await?;
            let path_arg = resolved.to_string_lossy().into_owned();
            self.kubectl(
                &["-n", &self.namespace, "apply", "-f", &path_arg],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
            Ok::<_, AdapterError>(())
        }
        .await;

        match result {
            Ok(()) => steps.push("Applied config manifest".to_string()),
            Err(e) => {
                warn!(error = %e, "config manifest update skipped");
                steps.push("Config manifest skipped (non-critical)".to_string());
            }
        }
    }
}

#[async_trait]
impl ClusterTarget for KubeDeployer {
    async fn deploy(
        &self,
        image_tag: &str,
        branch: &str,
        commit: &str,
        deployment_id: &str,
    ) -> AdapterResult<RolloutInfo> {
        let mut steps = Vec::new();
        let annotations = DeployAnnotations {
            deployment_id: deployment_id.to_string(),
            commit: commit.to_string(),
            branch: branch.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        // The managed image name is the tag without its version part.
        let image = image_tag.split(':').next().unwrap_or(image_tag);

        // Patch the release manifest in place.
        let manifest_file = self.resolve(&self.manifest_path);
        let content = tokio::fs::read_to_string(&manifest_file).await?;
        let patched = manifest::patch_release_manifest(&content, image, image_tag, &annotations)?;
        tokio::fs::write(&manifest_file, patched).await?;
        steps.push(format!("Updated release manifest with image {image_tag}"));

        // Apply it.
        let manifest_arg = manifest_file.to_string_lossy().into_owned();
        self.kubectl(
            &["-n", &self.namespace, "apply", "-f", &manifest_arg],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        steps.push("Applied release manifest".to_string());

        self.apply_config_manifest(&annotations, image_tag, &mut steps)
            .await;

        // Block until the rollout is ready, bounded by the timeout.
        info!(deployment = %self.deployment_name, "waiting for rollout");
        let timeout_arg = format!("--timeout={}s", self.rollout_timeout.as_secs());
        let target = format!("deployment/{}", self.deployment_name);
        let rollout = self
            .kubectl(
                &["-n", &self.namespace, "rollout", "status", &target, &timeout_arg],
                // Outer bound sits above kubectl's own timeout so kubectl
                // gets to report the failure itself.
                self.rollout_timeout + Duration::from_secs(30),
            )
            .await?;
        steps.push("Rollout completed".to_string());

        // The status snapshot is informational; the rollout already
        // succeeded by this point.
        let status = match self.deployment_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "could not capture deployment status");
                None
            }
        };

        Ok(RolloutInfo {
            image_tag: image_tag.to_string(),
            steps,
            rollout_output: rollout.stdout_trimmed(),
            status,
            finished_at: now_millis(),
        })
    }

    async fn deployment_status(&self) -> AdapterResult<ClusterStatus> {
        let out = self
            .kubectl(
                &[
                    "-n",
                    &self.namespace,
                    "get",
                    "deployment",
                    &self.deployment_name,
                    "-o",
                    "json",
                ],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        parse_cluster_status(&out.stdout, &self.namespace)
    }

    async fn pod_logs(&self, lines: usize) -> AdapterResult<String> {
        let target = format!("deployment/{}", self.deployment_name);
        let tail = format!("--tail={lines}");
        let out = self
            .kubectl(
                &["-n", &self.namespace, "logs", &target, &tail],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        Ok(out.stdout)
    }
}

/// Extract replica counts, conditions, and the running image from
/// `kubectl get deployment -o json` output.
fn parse_cluster_status(raw: &str, namespace: &str) -> AdapterResult<ClusterStatus> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AdapterError::Parse {
            program: "kubectl".to_string(),
            detail: format!("deployment json: {e}"),
        })?;

    let count = |field: &str| {
        value["status"][field].as_u64().unwrap_or(0) as u32
    };

    Ok(ClusterStatus {
        replicas: count("replicas"),
        ready_replicas: count("readyReplicas"),
        updated_replicas: count("updatedReplicas"),
        available_replicas: count("availableReplicas"),
        image: value["spec"]["template"]["spec"]["containers"][0]["image"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        namespace: namespace.to_string(),
        conditions: value["status"]["conditions"]
            .as_array()
            .cloned()
            .unwrap_or_default(),
    })
}
