//! Isolated execution of the scanner.
//!
//! A [`Sandbox`] owns the lifecycle of one scanner process per handle: start it against a
//! target, hand out its stdout, wait for it, stop it, and tear it down. [`DockerSandbox`]
//! drives the docker CLI; tests use a scripted in-process fake.

mod docker;
#[cfg(test)]
pub mod fake;

use std::{fmt, io, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use docker::DockerSandbox;

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Scanner stdout as a plain byte stream. Reads apply backpressure to the process.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to provision image {image}: {reason}")]
    Provisioning { image: String, reason: String },

    #[error("failed to start sandbox: {0}")]
    StartFailed(String),

    #[error("failed to stop sandbox {name}: {reason}")]
    StopFailed { name: String, reason: String },

    #[error("sandbox output was already taken")]
    OutputTaken,

    #[error("sandbox I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What to run. The scanner writes its records to stdout; that pipe is the output binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub job_id: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Fraction of one core.
    pub cpu_share: f64,
    /// Container network the scanner joins; the only route it has to the target.
    pub network: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_share: 0.5,
            network: "bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}"),
            None => f.write_str("a signal"),
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    type Handle: Send;

    fn name(&self) -> &'static str;

    /// Provisions the execution image if needed and starts the scanner.
    async fn start(&self, spec: &LaunchSpec) -> SandboxResult<Self::Handle>;

    /// Takes the process's stdout. Only the first call succeeds.
    fn stream_output(&self, handle: &mut Self::Handle) -> SandboxResult<OutputStream>;

    async fn wait(&self, handle: &mut Self::Handle) -> SandboxResult<ExitStatus>;

    /// Graceful stop, escalating to a hard kill once `grace` has passed.
    async fn stop(&self, handle: &mut Self::Handle, grace: Duration) -> SandboxResult<()>;

    /// Releases everything the handle owns. Safe to call after the process exited.
    async fn cleanup(&self, handle: Self::Handle) -> SandboxResult<()>;
}
