//! Drives one claimed job to a terminal state.
//!
//! The coordinator owns the sandbox handle for the duration of a run: it starts the scanner,
//! pumps its stdout through the record parser into the artifact and the job store, enforces
//! the deadline, and always tears the sandbox down before finalizing. Every failure is folded
//! into the job's error message; [`ScanCoordinator::run`] itself cannot fail.

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    artifact::{digest_file, ArtifactDigest, ArtifactStore, ArtifactWriter},
    config::AppConfig,
    models::{Job, JobKind, JobStatus},
    parser::{RawRecord, RecordStream},
    sandbox::{ExitStatus, LaunchSpec, OutputStream, Sandbox, SandboxError},
    security::in_scope,
    store::{Finalize, JobStore, StoreError},
};

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(200);
/// How long to wait for the process to be reaped after a stop before giving up on it.
const REAP_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("scan exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("unsupported job kind: {0}")]
    UnsupportedKind(String),

    #[error("target out of scope: {0}")]
    OutOfScope(String),
}

#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub deadline: Duration,
    pub stop_grace: Duration,
    pub max_record_bytes: usize,
    pub scope_allowlist: Vec<String>,
}

impl ScanPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            deadline: cfg.scan_timeout(),
            stop_grace: cfg.stop_grace(),
            max_record_bytes: cfg.max_record_bytes,
            scope_allowlist: cfg.scope_allowlist.clone(),
        }
    }
}

/// Findings streamed so far and the artifact they were copied into.
#[derive(Default)]
struct Progress {
    emitted: i64,
    skipped: u64,
    writer: Option<ArtifactWriter>,
}

pub struct ScanCoordinator<S, St> {
    sandbox: Arc<S>,
    store: Arc<St>,
    artifacts: ArtifactStore,
    policy: ScanPolicy,
}

impl<S, St> ScanCoordinator<S, St>
where
    S: Sandbox,
    St: JobStore,
{
    pub fn new(
        sandbox: Arc<S>,
        store: Arc<St>,
        artifacts: ArtifactStore,
        policy: ScanPolicy,
    ) -> Self {
        Self {
            sandbox,
            store,
            artifacts,
            policy,
        }
    }

    /// Runs the job and records its terminal state. Returns what was (or was attempted to
    /// be) written.
    pub async fn run(&self, job: &Job) -> Finalize {
        let started = Instant::now();
        let mut progress = Progress::default();
        let executed = self.execute(job, &mut progress).await;

        let sealed = match progress.writer.take() {
            Some(writer) => Some(seal(writer).await),
            None => None,
        };

        let outcome = conclude(executed, sealed, progress.emitted);
        info!(
            status = %outcome.status,
            findings = outcome.findings_count,
            skipped_lines = progress.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = outcome.error_message.as_deref().unwrap_or(""),
            "scan finished"
        );
        self.finalize(job, outcome).await
    }

    /// Marks the job failed without running anything. Used when a run blew up in a way that
    /// bypassed [`run`](Self::run), such as a panic.
    pub async fn fail(&self, job: &Job, message: impl Into<String>) -> Finalize {
        self.finalize(job, Finalize::failed(message)).await
    }

    async fn execute(&self, job: &Job, progress: &mut Progress) -> Result<ExitStatus, ScanError> {
        // One budget covers provisioning, start, streaming and the final wait.
        let deadline = Instant::now() + self.policy.deadline;

        job.kind
            .parse::<JobKind>()
            .map_err(|_| ScanError::UnsupportedKind(job.kind.clone()))?;

        if !in_scope(&job.target, &self.policy.scope_allowlist) {
            return Err(ScanError::OutOfScope(job.target.clone()));
        }

        // A re-run starts from nothing: stale findings go, the artifact is truncated.
        self.store.replace_findings(&job.id, &[]).await?;
        let writer = progress.writer.insert(self.artifacts.prepare(&job.id).await?);
        debug!(artifact = %writer.path().display(), "artifact prepared");

        let spec = LaunchSpec {
            job_id: job.id.clone(),
            target: job.target.clone(),
        };
        let mut handle = match timeout_at(deadline, self.sandbox.start(&spec)).await {
            Ok(started) => started?,
            Err(_) => {
                warn!(
                    deadline = ?self.policy.deadline,
                    "deadline reached while starting scanner"
                );
                return Err(ScanError::DeadlineExceeded(self.policy.deadline));
            }
        };
        info!(sandbox = self.sandbox.name(), "scanner started");

        let supervised = self.supervise(job, &mut handle, progress, deadline).await;

        if let Err(e) = self.sandbox.cleanup(handle).await {
            warn!(error = %e, "sandbox cleanup failed");
        }
        supervised
    }

    async fn supervise(
        &self,
        job: &Job,
        handle: &mut S::Handle,
        progress: &mut Progress,
        deadline: Instant,
    ) -> Result<ExitStatus, ScanError> {
        let output = self.sandbox.stream_output(handle)?;

        let pumped = timeout_at(deadline, self.pump_and_wait(job, output, handle, progress)).await;

        match pumped {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => {
                warn!(error = %e, "scan aborted, stopping scanner");
                self.terminate(handle).await;
                Err(e)
            }
            Err(_) => {
                warn!(deadline = ?self.policy.deadline, "deadline reached, stopping scanner");
                self.terminate(handle).await;
                Err(ScanError::DeadlineExceeded(self.policy.deadline))
            }
        }
    }

    async fn pump_and_wait(
        &self,
        job: &Job,
        output: OutputStream,
        handle: &mut S::Handle,
        progress: &mut Progress,
    ) -> Result<ExitStatus, ScanError> {
        let mut records = RecordStream::new(output, self.policy.max_record_bytes);
        let pumped = self.pump(job, &mut records, progress).await;
        progress.skipped = records.skipped();
        pumped?;

        let exit = self.sandbox.wait(handle).await?;
        debug!(%exit, "scanner exited");
        Ok(exit)
    }

    async fn pump(
        &self,
        job: &Job,
        records: &mut RecordStream<OutputStream>,
        progress: &mut Progress,
    ) -> Result<(), ScanError> {
        let Some(writer) = progress.writer.as_mut() else {
            return Ok(());
        };
        while let Some(RawRecord { raw, record }) = records.next_record().await? {
            let offset = writer.append_record(&raw).await?;
            let finding = record.into_finding(&job.target, writer.evidence_ref(offset));
            self.store
                .append_finding(&job.id, progress.emitted, &finding)
                .await?;
            debug!(
                seq = progress.emitted,
                title = %finding.title,
                severity = %finding.severity,
                "finding recorded"
            );
            progress.emitted += 1;
        }
        Ok(())
    }

    async fn terminate(&self, handle: &mut S::Handle) {
        if let Err(e) = self.sandbox.stop(handle, self.policy.stop_grace).await {
            error!(error = %e, "failed to stop scanner");
        }
        match timeout(self.policy.stop_grace + REAP_SLACK, self.sandbox.wait(handle)).await {
            Ok(Ok(exit)) => debug!(%exit, "scanner terminated"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap scanner"),
            Err(_) => error!("scanner still running after stop"),
        }
    }

    async fn finalize(&self, job: &Job, outcome: Finalize) -> Finalize {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.store.finalize(&job.id, &outcome).await {
                Ok(()) => {
                    debug!(status = %outcome.status, "job finalized");
                    break;
                }
                Err(StoreError::Database(e)) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(attempt, error = %e, "finalize failed, retrying");
                    sleep(FINALIZE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    // Finalizing twice or losing the row is a bug, not a job outcome.
                    error!(error = %e, status = %outcome.status, "could not finalize job");
                    break;
                }
            }
        }
        outcome
    }
}

async fn seal(writer: ArtifactWriter) -> io::Result<(PathBuf, ArtifactDigest)> {
    let path = writer.finish().await?;
    let digest = digest_file(&path).await?;
    Ok((path, digest))
}

/// Maps the run result and the sealed artifact onto the single terminal write.
fn conclude(
    executed: Result<ExitStatus, ScanError>,
    sealed: Option<io::Result<(PathBuf, ArtifactDigest)>>,
    emitted: i64,
) -> Finalize {
    let (artifact, seal_error) = match sealed {
        Some(Ok(artifact)) => (Some(artifact), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let empty = artifact.as_ref().map_or(true, |(_, d)| d.len == 0);

    let error_message = match (executed, seal_error) {
        (Err(e), _) => Some(e.to_string()),
        (Ok(_), Some(e)) => Some(format!("failed to seal artifact: {e}")),
        (Ok(exit), None) if exit.success() && !empty => None,
        (Ok(exit), None) if exit.success() => {
            Some("scan completed but no output produced".to_string())
        }
        (Ok(exit), None) if empty => Some(format!(
            "scanner exited with {exit} (no output produced)"
        )),
        (Ok(exit), None) => Some(format!("scanner exited with {exit}")),
    };

    let (artifact_path, artifact_hash) = match artifact {
        Some((path, digest)) => (Some(path.display().to_string()), Some(digest.sha256)),
        None => (None, None),
    };

    Finalize {
        status: if error_message.is_none() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        },
        findings_count: emitted,
        artifact_path,
        artifact_hash,
        error_message,
    }
}
