use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Finding, Job, JobStatus, NewFinding};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    NotFound(String),

    /// The job is not in the state the write requires. Finalizing twice lands here.
    #[error("job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("{0} is not a terminal status")]
    NotTerminal(JobStatus),
}

#[derive(Debug)]
pub enum ClaimOutcome {
    /// This worker now owns the job; it is `running`.
    Claimed(Job),
    /// A queued job was seen but another worker claimed it first.
    Lost(String),
    Empty,
}

/// The single terminal write for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalize {
    pub status: JobStatus,
    pub findings_count: i64,
    pub artifact_path: Option<String>,
    pub artifact_hash: Option<String>,
    pub error_message: Option<String>,
}

impl Finalize {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            findings_count: 0,
            artifact_path: None,
            artifact_hash: None,
            error_message: Some(message.into()),
        }
    }
}

/// What the worker needs from durable storage. Everything else (listing, reporting) is
/// the API layer's business.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn claim_next_queued(&self) -> StoreResult<ClaimOutcome>;

    async fn append_finding(&self, job_id: &str, seq: i64, finding: &NewFinding)
        -> StoreResult<()>;

    async fn replace_findings(&self, job_id: &str, findings: &[NewFinding]) -> StoreResult<()>;

    async fn finalize(&self, job_id: &str, outcome: &Finalize) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, name: &str, target: &str, kind: &str) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs(id, name, target, kind, status, created_at) VALUES(?, ?, ?, ?, 'queued', ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(target)
        .bind(kind)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT id, name, target, kind, status, created_at, started_at, finished_at, findings_count, artifact_path, artifact_hash, error_message FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn list_findings(&self, job_id: &str) -> StoreResult<Vec<Finding>> {
        let rows = sqlx::query_as::<_, Finding>(
            "SELECT id, job_id, seq, title, severity, description, resource, evidence_ref, created_at FROM findings WHERE job_id = ? ORDER BY seq ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Conditional `queued -> running` transition. Returns false when the job was not
    /// queued at the time of the write, which is how a lost race shows up.
    pub async fn try_claim(&self, job_id: &str) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, finished_at = NULL, error_message = NULL WHERE id = ? AND status = 'queued'",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Puts a job left `running` by a dead worker back in the queue. The next run purges
    /// whatever findings the dead run streamed.
    pub async fn requeue_orphan(&self, job_id: &str) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE jobs SET status = 'queued', started_at = NULL WHERE id = ? AND status = 'running'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.conflict_for(job_id, JobStatus::Running).await)
    }

    async fn conflict_for(&self, job_id: &str, expected: JobStatus) -> StoreError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => StoreError::Conflict {
                job_id: job_id.to_string(),
                expected,
                actual: job.status,
            },
            Ok(None) => StoreError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn claim_next_queued(&self) -> StoreResult<ClaimOutcome> {
        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((job_id,)) = candidate else {
            return Ok(ClaimOutcome::Empty);
        };

        if !self.try_claim(&job_id).await? {
            return Ok(ClaimOutcome::Lost(job_id));
        }

        match self.get_job(&job_id).await? {
            Some(job) => Ok(ClaimOutcome::Claimed(job)),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn append_finding(
        &self,
        job_id: &str,
        seq: i64,
        finding: &NewFinding,
    ) -> StoreResult<()> {
        insert_finding(&self.pool, job_id, seq, finding).await
    }

    async fn replace_findings(&self, job_id: &str, findings: &[NewFinding]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM findings WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        for (seq, finding) in findings.iter().enumerate() {
            insert_finding(&mut *tx, job_id, seq as i64, finding).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn finalize(&self, job_id: &str, outcome: &Finalize) -> StoreResult<()> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::NotTerminal(outcome.status));
        }

        let res = sqlx::query(
            "UPDATE jobs SET status = ?, finished_at = ?, findings_count = ?, artifact_path = ?, artifact_hash = ?, error_message = ? WHERE id = ? AND status = 'running'",
        )
        .bind(outcome.status)
        .bind(Utc::now())
        .bind(outcome.findings_count)
        .bind(&outcome.artifact_path)
        .bind(&outcome.artifact_hash)
        .bind(&outcome.error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.conflict_for(job_id, JobStatus::Running).await)
    }
}

async fn insert_finding<'e, E>(
    executor: E,
    job_id: &str,
    seq: i64,
    finding: &NewFinding,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO findings(id, job_id, seq, title, severity, description, resource, evidence_ref, created_at) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(job_id)
    .bind(seq)
    .bind(&finding.title)
    .bind(finding.severity)
    .bind(&finding.description)
    .bind(&finding.resource)
    .bind(&finding.evidence_ref)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}
