//! Command-line surface of the `scanwarden` binary.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    artifact::{digest_file, ArtifactStore},
    config::AppConfig,
    jobs::{DispatchPolicy, Dispatcher},
    models::{Finding, Job, JobKind, JobStatus},
    sandbox::DockerSandbox,
    scan::{ScanCoordinator, ScanPolicy},
    store::SqliteJobStore,
};

/// Sandboxed security-scan job worker
#[derive(Parser, Debug)]
#[command(
    name = "scanwarden",
    version,
    about = "Claims queued scan jobs and runs them in a sandbox"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "SCANWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the dispatch loop until interrupted (default)
    Run {
        /// Exit once the queue is empty instead of polling forever
        #[arg(long)]
        drain: bool,
    },

    /// Queue a scan job
    Enqueue {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "nuclei")]
        kind: String,
    },

    /// Put a job orphaned in `running` by a dead worker back in the queue
    Requeue { job_id: String },

    /// Print a job and its findings as JSON
    Show { job_id: String },

    /// Recompute a finished job's artifact hash and compare it with the recorded one
    Verify { job_id: String },
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { drain: false })
    }
}

pub async fn run_worker(
    cfg: Arc<AppConfig>,
    store: SqliteJobStore,
    drain: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let store = Arc::new(store);
    let sandbox = Arc::new(DockerSandbox::from_config(&cfg));
    let artifacts = ArtifactStore::new(cfg.artifacts_dir.clone());
    tokio::fs::create_dir_all(&cfg.artifacts_dir)
        .await
        .with_context(|| format!("failed to create {}", cfg.artifacts_dir.display()))?;

    let coordinator =
        ScanCoordinator::new(sandbox, store.clone(), artifacts, ScanPolicy::from_config(&cfg));
    let mut policy = DispatchPolicy::from_config(&cfg);
    policy.shutdown_when_queue_empty = drain;

    info!(
        image = %cfg.scanner_image,
        artifacts = %cfg.artifacts_dir.display(),
        deadline_secs = cfg.scan_timeout_secs,
        "worker starting"
    );
    Dispatcher::new(store, coordinator, policy, shutdown).run().await;
    Ok(())
}

pub async fn enqueue(
    store: &SqliteJobStore,
    target: &str,
    name: &str,
    kind: &str,
) -> anyhow::Result<String> {
    let target = target.trim();
    if target.is_empty() {
        bail!("target must not be empty");
    }
    let kind = kind
        .parse::<JobKind>()
        .map_err(|k| anyhow::anyhow!("unsupported job kind: {k}"))?;
    let id = store.enqueue(name, target, kind.as_str()).await?;
    info!(job_id = %id, target = %target, "job queued");
    Ok(id)
}

pub async fn requeue(store: &SqliteJobStore, job_id: &str) -> anyhow::Result<()> {
    store
        .requeue_orphan(job_id)
        .await
        .with_context(|| format!("cannot requeue job {job_id}"))?;
    info!(job_id, "job requeued");
    Ok(())
}

#[derive(Debug, serde::Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub job: Job,
    pub findings: Vec<Finding>,
}

/// Current state of a job, including findings streamed by a run still in progress.
pub async fn show(store: &SqliteJobStore, job_id: &str) -> anyhow::Result<JobReport> {
    let job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;
    let findings = store.list_findings(job_id).await?;
    Ok(JobReport { job, findings })
}

#[derive(Debug, PartialEq, Eq)]
pub struct Verification {
    pub path: PathBuf,
    pub recorded: String,
    pub actual: String,
}

impl Verification {
    pub fn intact(&self) -> bool {
        self.recorded == self.actual
    }
}

pub async fn verify(store: &SqliteJobStore, job_id: &str) -> anyhow::Result<Verification> {
    let job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;
    if !job.status.is_terminal() {
        bail!("job {job_id} is {}, nothing to verify yet", job.status);
    }
    let (Some(path), Some(recorded)) = (job.artifact_path, job.artifact_hash) else {
        bail!(
            "job {job_id} has no artifact ({})",
            if job.status == JobStatus::Failed {
                job.error_message.as_deref().unwrap_or("failed")
            } else {
                "completed"
            }
        );
    };
    let path = PathBuf::from(path);
    let digest = digest_file(&path)
        .await
        .with_context(|| format!("failed to read artifact {}", path.display()))?;
    Ok(Verification {
        path,
        recorded,
        actual: digest.sha256,
    })
}
