//! capstand — the Capstan daemon.
//!
//! Single binary that assembles the release orchestration subsystems:
//! - State store (redb): deployment records + operation leases
//! - Command adapters: git workspace, docker builder, kubectl deployer
//! - Pipeline orchestrator
//! - REST API
//!
//! # Usage
//!
//! ```text
//! capstand --repo-path /srv/shopfront --image shopfront \
//!     --namespace prod --deployment-name shopfront
//! ```
//!
//! Every flag can also be set through its `CAPSTAN_*` environment
//! variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use capstan_adapters::{DockerBuilder, GitWorkspace, KubeDeployer};
use capstan_pipeline::Orchestrator;
use capstan_state::StateStore;

#[derive(Parser)]
#[command(name = "capstand", about = "Capstan release orchestration daemon")]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "CAPSTAN_PORT", default_value = "8090")]
    port: u16,

    /// Data directory for persistent state.
    #[arg(long, env = "CAPSTAN_DATA_DIR", default_value = "/var/lib/capstan")]
    data_dir: PathBuf,

    /// Path to the managed repository checkout.
    #[arg(long, env = "CAPSTAN_REPO_PATH")]
    repo_path: PathBuf,

    /// Git remote to sync from.
    #[arg(long, env = "CAPSTAN_GIT_REMOTE", default_value = "origin")]
    remote: String,

    /// Managed image name (without tag).
    #[arg(long, env = "CAPSTAN_IMAGE")]
    image: String,

    /// Dockerfile path, relative to the repository root.
    #[arg(long, env = "CAPSTAN_DOCKERFILE", default_value = "Dockerfile")]
    dockerfile: String,

    /// Kubernetes namespace to deploy into.
    #[arg(long, env = "CAPSTAN_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Release manifest path, relative to the repository root.
    #[arg(
        long,
        env = "CAPSTAN_MANIFEST_PATH",
        default_value = "k8s/deployment.yaml"
    )]
    manifest_path: PathBuf,

    /// Optional companion ConfigMap manifest path.
    #[arg(long, env = "CAPSTAN_CONFIG_MANIFEST_PATH")]
    config_manifest_path: Option<PathBuf>,

    /// Name of the managed Kubernetes deployment.
    #[arg(long, env = "CAPSTAN_DEPLOYMENT_NAME")]
    deployment_name: String,

    /// How many uniquely-tagged images to keep after a release.
    #[arg(long, env = "CAPSTAN_KEEP_IMAGES", default_value = "5")]
    keep_images: usize,

    /// Operation lease timeout in seconds.
    #[arg(long, env = "CAPSTAN_LEASE_TIMEOUT_SECS", default_value = "300")]
    lease_timeout_secs: u64,

    /// Rollout wait timeout in seconds.
    #[arg(long, env = "CAPSTAN_ROLLOUT_TIMEOUT_SECS", default_value = "300")]
    rollout_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capstand=debug,capstan=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Capstan daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("capstan.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = StateStore::open(&db_path)?
        .with_lease_timeout(Duration::from_secs(cli.lease_timeout_secs));
    info!(path = ?db_path, "state store opened");

    // Leases left behind by a previous process are dead by definition.
    let swept = store.sweep_expired_leases();
    if swept > 0 {
        warn!(swept, "removed stale operation leases from previous run");
    }

    // Command adapters.
    let source = Arc::new(GitWorkspace::new(&cli.repo_path, &cli.remote));
    let builder = Arc::new(DockerBuilder::new(
        &cli.repo_path,
        &cli.image,
        &cli.dockerfile,
    ));
    let cluster = Arc::new(KubeDeployer::new(
        &cli.namespace,
        &cli.repo_path,
        &cli.manifest_path,
        cli.config_manifest_path.clone(),
        &cli.deployment_name,
        Duration::from_secs(cli.rollout_timeout_secs),
    ));
    info!(
        repo = ?cli.repo_path,
        image = %cli.image,
        namespace = %cli.namespace,
        "adapters initialized"
    );

    // Orchestrator.
    let orchestrator = Orchestrator::new(store, source, builder, cluster)
        .with_keep_images(cli.keep_images);
    info!(keep_images = cli.keep_images, "orchestrator initialized");

    // ── Start API server ───────────────────────────────────────

    let router = capstan_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C. In-flight pipeline tasks are detached
    // and stop with the process; their leases expire on their own.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not install CTRL+C handler");
                return;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Capstan daemon stopped");
    Ok(())
}
