use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scan engines a worker knows how to drive. Stored as free text on the job row so
/// that an unknown kind can still be claimed and failed with a readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Nuclei,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Nuclei => "nuclei",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nuclei" => Ok(JobKind::Nuclei),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub target: String,
    pub kind: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub findings_count: i64,
    pub artifact_path: Option<String>,
    pub artifact_hash: Option<String>,
    pub error_message: Option<String>,
}

/// Ordered from least to most severe so `max()` over a job's findings gives its worst.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Maps a scanner-reported severity onto the fixed scale. Anything unrecognised is
    /// treated as informational.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            "info" | "informational" | "unknown" => Severity::Info,
            _ => Severity::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding as produced by the parser, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NewFinding {
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub resource: String,
    pub evidence_ref: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Finding {
    pub id: String,
    pub job_id: String,
    pub seq: i64,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub resource: String,
    pub evidence_ref: String,
    pub created_at: DateTime<Utc>,
}
