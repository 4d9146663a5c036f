//! Scripted in-process sandbox for coordinator and dispatcher tests.

use std::{
    collections::VecDeque,
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};

use super::{ExitStatus, LaunchSpec, OutputStream, Sandbox, SandboxError, SandboxResult};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Writes `output` then exits with `code`.
    Exit { output: Vec<u8>, code: i32 },
    /// Writes `output` then never finishes until stopped; exits 137 afterwards.
    Hang { output: Vec<u8> },
    FailStart(String),
    /// `start` never returns, like a pull from an unresponsive registry.
    HangStart,
    Panic,
}

impl Behavior {
    pub fn exit(output: &str, code: i32) -> Self {
        Behavior::Exit {
            output: output.as_bytes().to_vec(),
            code,
        }
    }

    pub fn hang(output: &str) -> Self {
        Behavior::Hang {
            output: output.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeLog {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub live: AtomicUsize,
    pub launched: Mutex<Vec<LaunchSpec>>,
}

impl FakeLog {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Handles started but never cleaned up.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.target.clone())
            .collect()
    }
}

/// Pops one behavior per `start`; the last one repeats.
pub struct FakeSandbox {
    script: Mutex<VecDeque<Behavior>>,
    pub log: Arc<FakeLog>,
}

pub struct FakeHandle {
    output: Option<OutputStream>,
    exit: ExitStatus,
    hanging: bool,
    stopped: bool,
    // Held open so a hanging scanner's stdout never reaches EOF.
    writer: Option<DuplexStream>,
}

impl FakeSandbox {
    pub fn scripted(behaviors: Vec<Behavior>) -> Self {
        Self {
            script: Mutex::new(behaviors.into()),
            log: Arc::new(FakeLog::default()),
        }
    }

    fn next_behavior(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Behavior::exit("", 0))
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    type Handle = FakeHandle;

    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(&self, spec: &LaunchSpec) -> SandboxResult<FakeHandle> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        self.log.launched.lock().unwrap().push(spec.clone());

        let handle = match self.next_behavior() {
            Behavior::FailStart(reason) => return Err(SandboxError::StartFailed(reason)),
            Behavior::HangStart => std::future::pending().await,
            Behavior::Panic => panic!("fake sandbox exploded"),
            Behavior::Exit { output, code } => FakeHandle {
                output: Some(Box::new(Cursor::new(output))),
                exit: ExitStatus { code: Some(code) },
                hanging: false,
                stopped: false,
                writer: None,
            },
            Behavior::Hang { output } => {
                let (mut writer, reader) = tokio::io::duplex(output.len().max(1024) + 1);
                writer.write_all(&output).await?;
                FakeHandle {
                    output: Some(Box::new(reader)),
                    exit: ExitStatus { code: Some(137) },
                    hanging: true,
                    stopped: false,
                    writer: Some(writer),
                }
            }
        };
        self.log.live.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn stream_output(&self, handle: &mut FakeHandle) -> SandboxResult<OutputStream> {
        handle.output.take().ok_or(SandboxError::OutputTaken)
    }

    async fn wait(&self, handle: &mut FakeHandle) -> SandboxResult<ExitStatus> {
        if handle.hanging && !handle.stopped {
            std::future::pending::<()>().await;
        }
        Ok(handle.exit)
    }

    async fn stop(&self, handle: &mut FakeHandle, _grace: Duration) -> SandboxResult<()> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        handle.stopped = true;
        handle.writer = None;
        Ok(())
    }

    async fn cleanup(&self, handle: FakeHandle) -> SandboxResult<()> {
        self.log.cleanups.fetch_add(1, Ordering::SeqCst);
        self.log.live.fetch_sub(1, Ordering::SeqCst);
        drop(handle);
        Ok(())
    }
}
