use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    sync::OnceCell,
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    ExitStatus, LaunchSpec, OutputStream, ResourceLimits, Sandbox, SandboxError, SandboxResult,
};
use crate::config::AppConfig;

/// Extra time allowed for the docker CLI itself on top of the stop grace period.
const CLI_SLACK: Duration = Duration::from_secs(5);
const PIDS_LIMIT: u32 = 512;

/// Runs the scanner as a throwaway container through the docker CLI.
#[derive(Debug)]
pub struct DockerSandbox {
    docker_bin: String,
    image: String,
    limits: ResourceLimits,
    request_timeout_secs: u64,
    provisioned: OnceCell<()>,
}

#[derive(Debug)]
pub struct DockerHandle {
    container: String,
    docker_bin: String,
    child: Child,
    stdout: Option<ChildStdout>,
    released: bool,
}

impl Drop for DockerHandle {
    // A handle dropped without `cleanup` (a panicking job) would otherwise leave the
    // container running: killing the attached client does not stop it.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                container = %self.container,
                "handle dropped outside a runtime, container may leak"
            );
            return;
        };
        let docker_bin = self.docker_bin.clone();
        let container = self.container.clone();
        runtime.spawn(async move {
            let removed = Command::new(&docker_bin)
                .args(["rm", "--force", &container])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            warn!(
                container = %container,
                removed = ?removed,
                "removed container of an abandoned handle"
            );
        });
    }
}

impl DockerSandbox {
    pub fn new(
        docker_bin: impl Into<String>,
        image: impl Into<String>,
        limits: ResourceLimits,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image: image.into(),
            limits,
            request_timeout_secs,
            provisioned: OnceCell::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            cfg.docker_bin.clone(),
            cfg.scanner_image.clone(),
            ResourceLimits {
                memory_bytes: cfg.memory_limit_bytes,
                cpu_share: cfg.cpu_share,
                network: cfg.network.clone(),
            },
            cfg.request_timeout_secs,
        )
    }

    fn container_name(job_id: &str) -> String {
        format!("scanwarden-{job_id}")
    }

    fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let memory = self.limits.memory_bytes.to_string();
        vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            Self::container_name(&spec.job_id),
            "--label".into(),
            format!("scanwarden.job={}", spec.job_id),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpus".into(),
            format!("{:.2}", self.limits.cpu_share),
            "--pids-limit".into(),
            PIDS_LIMIT.to_string(),
            "--network".into(),
            self.limits.network.clone(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            self.image.clone(),
            "-u".into(),
            spec.target.clone(),
            "-jsonl".into(),
            "-timeout".into(),
            self.request_timeout_secs.to_string(),
            "-no-color".into(),
            "-silent".into(),
        ]
    }

    async fn docker_status(&self, args: &[&str]) -> std::io::Result<std::process::ExitStatus> {
        // A start abandoned at the deadline must not leave the CLI call behind.
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
    }

    async fn ensure_image(&self) -> SandboxResult<()> {
        let provisioning = |reason: String| SandboxError::Provisioning {
            image: self.image.clone(),
            reason,
        };

        let present = self
            .docker_status(&["image", "inspect", &self.image])
            .await
            .map_err(|e| provisioning(format!("docker unavailable: {e}")))?;
        if present.success() {
            debug!(image = %self.image, "scanner image present");
            return Ok(());
        }

        info!(image = %self.image, "scanner image not found locally, pulling");
        let mut child = Command::new(&self.docker_bin)
            .args(["pull", &self.image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| provisioning(format!("failed to spawn docker pull: {e}")))?;

        // Both pipes are drained together so neither can fill up and stall the pull.
        let errors = child.stderr.take().map(|stderr| {
            let image = self.image.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(image = %image, line = %line, "docker pull stderr");
                    if !line.trim().is_empty() {
                        last = line;
                    }
                }
                last
            })
        });
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(image = %self.image, progress = %line, "provisioning scanner image");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| provisioning(e.to_string()))?;
        let last_error = match errors {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            let reason = if last_error.is_empty() {
                format!("docker pull exited with {status}")
            } else {
                last_error.trim().to_string()
            };
            return Err(provisioning(reason));
        }
        info!(image = %self.image, "scanner image ready");
        Ok(())
    }

    async fn remove_container(&self, name: &str) {
        match self.docker_status(&["rm", "--force", name]).await {
            Ok(status) if status.success() => debug!(container = name, "removed container"),
            Ok(_) => debug!(container = name, "no container to remove"),
            Err(e) => warn!(container = name, error = %e, "docker rm failed"),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    type Handle = DockerHandle;

    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, spec: &LaunchSpec) -> SandboxResult<DockerHandle> {
        // A failed pull leaves the cell empty so the next job retries provisioning.
        self.provisioned
            .get_or_try_init(|| self.ensure_image())
            .await?;

        let container = Self::container_name(&spec.job_id);
        // Leftover from a crashed run of the same job.
        self.remove_container(&container).await;

        let args = self.run_args(spec);
        info!(container = %container, target = %spec.target, "audit: launching scanner");
        let mut child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::StartFailed(format!("failed to spawn docker run: {e}")))?;

        if let Some(stderr) = child.stderr.take() {
            let container = container.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(container = %container, line = %line, "scanner stderr");
                }
            });
        }

        let stdout = child.stdout.take();
        Ok(DockerHandle {
            container,
            docker_bin: self.docker_bin.clone(),
            child,
            stdout,
            released: false,
        })
    }

    fn stream_output(&self, handle: &mut DockerHandle) -> SandboxResult<OutputStream> {
        handle
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream)
            .ok_or(SandboxError::OutputTaken)
    }

    async fn wait(&self, handle: &mut DockerHandle) -> SandboxResult<ExitStatus> {
        let status = handle.child.wait().await?;
        Ok(status.into())
    }

    async fn stop(&self, handle: &mut DockerHandle, grace: Duration) -> SandboxResult<()> {
        let grace_secs = grace.as_secs().to_string();
        info!(container = %handle.container, grace_secs = %grace_secs, "stopping scanner");

        let stopped = timeout(
            grace + CLI_SLACK,
            self.docker_status(&["stop", "--time", &grace_secs, &handle.container]),
        )
        .await;

        let result = match stopped {
            Ok(Ok(status)) if status.success() => Ok(()),
            other => {
                warn!(
                    container = %handle.container,
                    outcome = ?other,
                    "graceful stop failed, killing"
                );
                match self.docker_status(&["kill", &handle.container]).await {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(SandboxError::StopFailed {
                        name: handle.container.clone(),
                        reason: format!("docker kill exited with {status}"),
                    }),
                    Err(e) => Err(SandboxError::StopFailed {
                        name: handle.container.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        };

        // The attached `docker run` client goes too, whatever happened to the container.
        if let Err(e) = handle.child.kill().await {
            debug!(container = %handle.container, error = %e, "docker client already gone");
        }
        result
    }

    async fn cleanup(&self, mut handle: DockerHandle) -> SandboxResult<()> {
        if let Ok(None) = handle.child.try_wait() {
            handle.child.kill().await?;
        }
        // `--rm` normally removes the container; this covers a daemon that lost track.
        self.remove_container(&handle.container).await;
        handle.released = true;
        Ok(())
    }
}
