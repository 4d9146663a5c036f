use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

use crate::{
    config::AppConfig,
    models::{Job, JobStatus},
    sandbox::Sandbox,
    scan::ScanCoordinator,
    store::{ClaimOutcome, JobStore},
};

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub poll_interval: Duration,
    pub jitter: Duration,
    /// Exit once a poll finds nothing instead of sleeping. Used by tests and one-shot runs.
    pub shutdown_when_queue_empty: bool,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            jitter: cfg.poll_jitter(),
            shutdown_when_queue_empty: false,
        }
    }

    /// Poll interval plus a random share of the jitter, so replicas drift apart.
    pub fn sleep_duration(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}

/// Where the worker is in its cycle. One job at a time moves through
/// `Idle -> Claimed -> Running -> Finalized -> Idle`.
#[derive(Debug)]
pub enum WorkerState {
    Idle,
    Claimed(Job),
    Running(Job),
    Finalized { job_id: String, status: JobStatus },
    Stopped,
}

pub struct Dispatcher<S, St> {
    store: Arc<St>,
    coordinator: ScanCoordinator<S, St>,
    policy: DispatchPolicy,
    shutdown: CancellationToken,
}

impl<S, St> Dispatcher<S, St>
where
    S: Sandbox,
    St: JobStore,
{
    pub fn new(
        store: Arc<St>,
        coordinator: ScanCoordinator<S, St>,
        policy: DispatchPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            coordinator,
            policy,
            shutdown,
        }
    }

    /// Processes jobs until the shutdown token fires. Shutdown is only honoured between
    /// jobs; a running scan is bounded by its own deadline.
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.policy.poll_interval,
            jitter = ?self.policy.jitter,
            "dispatcher started"
        );
        let mut state = WorkerState::Idle;
        loop {
            if matches!(state, WorkerState::Idle) && self.shutdown.is_cancelled() {
                state = WorkerState::Stopped;
            }
            if matches!(state, WorkerState::Stopped) {
                break;
            }
            state = self.step(state).await;
        }
        info!("dispatcher stopped");
    }

    pub async fn step(&self, state: WorkerState) -> WorkerState {
        match state {
            WorkerState::Idle => self.poll().await,
            WorkerState::Claimed(job) => {
                info!(job_id = %job.id, target = %job.target, kind = %job.kind, "claimed job");
                WorkerState::Running(job)
            }
            WorkerState::Running(job) => {
                let status = self.execute(&job).await;
                WorkerState::Finalized {
                    job_id: job.id,
                    status,
                }
            }
            WorkerState::Finalized { job_id, status } => {
                debug!(job_id = %job_id, status = %status, "returning to poll");
                WorkerState::Idle
            }
            WorkerState::Stopped => WorkerState::Stopped,
        }
    }

    async fn poll(&self) -> WorkerState {
        trace!("looking for the next queued job");
        match self.store.claim_next_queued().await {
            Ok(ClaimOutcome::Claimed(job)) => WorkerState::Claimed(job),
            Ok(ClaimOutcome::Lost(job_id)) => {
                debug!(job_id = %job_id, "another worker claimed the job first");
                WorkerState::Idle
            }
            Ok(ClaimOutcome::Empty) if self.policy.shutdown_when_queue_empty => {
                debug!("queue empty, shutting down");
                WorkerState::Stopped
            }
            Ok(ClaimOutcome::Empty) => {
                self.pause().await;
                WorkerState::Idle
            }
            Err(e) => {
                error!(error = %e, "failed to poll job store");
                self.pause().await;
                WorkerState::Idle
            }
        }
    }

    async fn execute(&self, job: &Job) -> JobStatus {
        let span = info_span!("job", job.id = %job.id, job.kind = %job.kind);

        let result = AssertUnwindSafe(self.coordinator.run(job))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        match result {
            Ok(outcome) => outcome.status,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(parent: &span, panic = %message, "job panicked");
                self.coordinator
                    .fail(job, format!("worker panicked: {message}"))
                    .instrument(span)
                    .await
                    .status
            }
        }
    }

    async fn pause(&self) {
        let wait = self.policy.sleep_duration();
        tokio::select! {
            _ = sleep(wait) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        artifact::ArtifactStore,
        db::testing::temp_pool,
        models::NewFinding,
        sandbox::fake::{Behavior, FakeSandbox},
        scan::ScanPolicy,
        store::{Finalize, SqliteJobStore, StoreError, StoreResult},
    };

    const ONE_RECORD: &str = "{\"info\":{\"name\":\"found\",\"severity\":\"medium\"}}\n";

    /// Fails the first `failures` polls and reports the next `contested` ones as lost to
    /// another worker, then behaves like the wrapped store.
    struct FlakyStore {
        inner: SqliteJobStore,
        failures: usize,
        contested: usize,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn claim_next_queued(&self) -> StoreResult<ClaimOutcome> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            if poll < self.failures {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            if poll < self.failures + self.contested {
                return Ok(ClaimOutcome::Lost("claimed-elsewhere".to_string()));
            }
            self.inner.claim_next_queued().await
        }

        async fn append_finding(
            &self,
            job_id: &str,
            seq: i64,
            finding: &NewFinding,
        ) -> StoreResult<()> {
            self.inner.append_finding(job_id, seq, finding).await
        }

        async fn replace_findings(
            &self,
            job_id: &str,
            findings: &[NewFinding],
        ) -> StoreResult<()> {
            self.inner.replace_findings(job_id, findings).await
        }

        async fn finalize(&self, job_id: &str, outcome: &Finalize) -> StoreResult<()> {
            self.inner.finalize(job_id, outcome).await
        }
    }

    struct Setup {
        sqlite: SqliteJobStore,
        sandbox: Arc<FakeSandbox>,
        dispatcher: Arc<Dispatcher<FakeSandbox, FlakyStore>>,
        shutdown: CancellationToken,
        _db: tempfile::TempDir,
        _artifacts: tempfile::TempDir,
    }

    async fn setup(behaviors: Vec<Behavior>, failures: usize, policy: DispatchPolicy) -> Setup {
        setup_contested(behaviors, failures, 0, policy).await
    }

    async fn setup_contested(
        behaviors: Vec<Behavior>,
        failures: usize,
        contested: usize,
        policy: DispatchPolicy,
    ) -> Setup {
        let (pool, db) = temp_pool().await;
        let artifacts = tempfile::tempdir().unwrap();
        let sqlite = SqliteJobStore::new(pool);
        let store = Arc::new(FlakyStore {
            inner: sqlite.clone(),
            failures,
            contested,
            polls: AtomicUsize::new(0),
        });
        let sandbox = Arc::new(FakeSandbox::scripted(behaviors));
        let coordinator = ScanCoordinator::new(
            sandbox.clone(),
            store.clone(),
            ArtifactStore::new(artifacts.path()),
            ScanPolicy {
                deadline: Duration::from_secs(10),
                stop_grace: Duration::from_millis(50),
                max_record_bytes: 64 * 1024,
                scope_allowlist: Vec::new(),
            },
        );
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            coordinator,
            policy,
            shutdown.clone(),
        ));
        Setup {
            sqlite,
            sandbox,
            dispatcher,
            shutdown,
            _db: db,
            _artifacts: artifacts,
        }
    }

    fn drain_policy() -> DispatchPolicy {
        DispatchPolicy {
            poll_interval: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
            shutdown_when_queue_empty: true,
        }
    }

    async fn status_of(store: &SqliteJobStore, id: &str) -> (JobStatus, Option<String>) {
        let job = store.get_job(id).await.unwrap().unwrap();
        (job.status, job.error_message)
    }

    #[tokio::test]
    async fn drains_the_queue_after_a_transient_store_error() {
        let s = setup(vec![Behavior::exit(ONE_RECORD, 0)], 2, drain_policy()).await;
        let a = s.sqlite.enqueue("a", "https://a.test", "nuclei").await.unwrap();
        let b = s.sqlite.enqueue("b", "https://b.test", "zap").await.unwrap();
        let c = s.sqlite.enqueue("c", "https://c.test", "nuclei").await.unwrap();

        s.dispatcher.run().await;

        assert_eq!(status_of(&s.sqlite, &a).await, (JobStatus::Completed, None));
        assert_eq!(
            status_of(&s.sqlite, &b).await,
            (
                JobStatus::Failed,
                Some("unsupported job kind: zap".to_string())
            )
        );
        assert_eq!(status_of(&s.sqlite, &c).await, (JobStatus::Completed, None));
        assert_eq!(
            s.sandbox.log.targets(),
            vec!["https://a.test".to_string(), "https://c.test".to_string()]
        );
    }

    #[tokio::test]
    async fn a_panicking_job_fails_and_the_loop_keeps_going() {
        let s = setup(
            vec![Behavior::Panic, Behavior::exit(ONE_RECORD, 0)],
            0,
            drain_policy(),
        )
        .await;
        let first = s.sqlite.enqueue("", "https://a.test", "nuclei").await.unwrap();
        let second = s.sqlite.enqueue("", "https://b.test", "nuclei").await.unwrap();

        s.dispatcher.run().await;

        let (status, message) = status_of(&s.sqlite, &first).await;
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            message.as_deref(),
            Some("worker panicked: fake sandbox exploded")
        );
        assert_eq!(
            status_of(&s.sqlite, &second).await,
            (JobStatus::Completed, None)
        );
    }

    #[tokio::test]
    async fn steps_walk_through_the_job_lifecycle() {
        let s = setup(vec![Behavior::exit(ONE_RECORD, 0)], 0, drain_policy()).await;
        let id = s.sqlite.enqueue("", "https://a.test", "nuclei").await.unwrap();

        let job = match s.dispatcher.step(WorkerState::Idle).await {
            WorkerState::Claimed(job) => job,
            other => panic!("expected a claim, got {other:?}"),
        };
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);

        let state = s.dispatcher.step(WorkerState::Claimed(job)).await;
        assert!(matches!(state, WorkerState::Running(_)));

        let state = s.dispatcher.step(state).await;
        match &state {
            WorkerState::Finalized { job_id, status } => {
                assert_eq!(job_id, &id);
                assert_eq!(*status, JobStatus::Completed);
            }
            other => panic!("expected finalized, got {other:?}"),
        }

        assert!(matches!(
            s.dispatcher.step(state).await,
            WorkerState::Idle
        ));
        assert!(matches!(
            s.dispatcher.step(WorkerState::Idle).await,
            WorkerState::Stopped
        ));
    }

    #[tokio::test]
    async fn a_lost_claim_returns_to_idle_and_polls_again() {
        let s = setup_contested(vec![Behavior::exit(ONE_RECORD, 0)], 0, 2, drain_policy()).await;
        let id = s.sqlite.enqueue("", "https://a.test", "nuclei").await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                s.dispatcher.step(WorkerState::Idle).await,
                WorkerState::Idle
            ));
        }
        assert_eq!(s.sandbox.log.starts(), 0);
        assert_eq!(status_of(&s.sqlite, &id).await, (JobStatus::Queued, None));

        s.dispatcher.run().await;
        assert_eq!(status_of(&s.sqlite, &id).await, (JobStatus::Completed, None));
        assert_eq!(s.sandbox.log.starts(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_an_idle_wait() {
        let s = setup(
            vec![Behavior::exit(ONE_RECORD, 0)],
            0,
            DispatchPolicy {
                poll_interval: Duration::from_secs(60),
                jitter: Duration::ZERO,
                shutdown_when_queue_empty: false,
            },
        )
        .await;

        let dispatcher = s.dispatcher.clone();
        let worker = tokio::spawn(async move { dispatcher.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("dispatcher should stop promptly")
            .unwrap();
        assert_eq!(s.sandbox.log.starts(), 0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = DispatchPolicy {
            poll_interval: Duration::from_millis(100),
            jitter: Duration::from_millis(20),
            shutdown_when_queue_empty: false,
        };
        for _ in 0..100 {
            let d = policy.sleep_duration();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(120));
        }

        let flat = DispatchPolicy {
            jitter: Duration::ZERO,
            ..policy
        };
        assert_eq!(flat.sleep_duration(), Duration::from_millis(100));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }
}
