//! The claim → screen → execute → finalise loop.
//!
//! One worker processes one task at a time. Wake-ups come from the task
//! change-notification channel (immediate) and a fallback ticker (forward
//! progress when notifications are lost); each wake runs the stale-task
//! recovery pass and then attempts exactly one claim. Remaining queued work
//! triggers further notifications, so draining happens one task per wake by
//! design.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sandbox::{SandboxError, ScriptSandbox};
use crate::screener::CodeScreener;
use crate::stats::WorkerStats;
use crate::store::{PriorityBand, TaskStore};

/// Maximum execution attempts per task before it is marked failed.
const MAX_ATTEMPTS: u32 = 3;

/// Pause between execution attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Lower bound on the fallback polling interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Floor-clamp the configured polling interval so a zero or tiny value
/// cannot starve the store with a hot poll loop.
pub fn effective_poll_interval(configured: Duration) -> Duration {
    configured.max(MIN_POLL_INTERVAL)
}

enum Outcome {
    Completed(String),
    Failed(SandboxError),
    Cancelled,
}

/// A single task-processing worker.
pub struct Worker<S, X, C> {
    id: Uuid,
    store: S,
    sandbox: Arc<X>,
    screener: C,
    stats: Arc<WorkerStats>,
    band: PriorityBand,
    poll_interval: Duration,
}

impl<S, X, C> Worker<S, X, C>
where
    S: TaskStore,
    X: ScriptSandbox,
    C: CodeScreener,
{
    pub fn new(
        id: Uuid,
        store: S,
        sandbox: Arc<X>,
        screener: C,
        stats: Arc<WorkerStats>,
        band: PriorityBand,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            store,
            sandbox,
            screener,
            stats,
            band,
            poll_interval,
        }
    }

    /// Drive the worker until `cancel` fires.
    ///
    /// `notifications` is the wake-up feed from the task store subscription;
    /// tokens are opaque and may be duplicated or lost.
    pub async fn run(self, mut notifications: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(effective_poll_interval(self.poll_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the interval's immediate first tick; the explicit startup
        // pass below covers it.
        ticker.tick().await;

        info!(worker_id = %self.id, "worker started; waiting for tasks");
        self.wake(&cancel).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker_id = %self.id, "shutdown requested; worker loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.wake(&cancel).await;
                }
                Some(()) = notifications.recv() => {
                    debug!("task change notification received");
                    self.wake(&cancel).await;
                }
            }
        }
    }

    async fn wake(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        self.recover().await;
        self.process_next(cancel).await;
    }

    async fn recover(&self) {
        match self.store.recover_stale().await {
            Ok(0) => {}
            Ok(count) => info!(recovered = count, "recovered stale running tasks"),
            Err(e) => {
                error!(error = %e, "stale-task recovery failed");
                self.stats.database_failure();
            }
        }
    }

    /// One claim-and-process cycle; claims at most one task.
    async fn process_next(&self, cancel: &CancellationToken) {
        let worker_id = self.id.to_string();
        let task = match self.store.claim_one(&worker_id, self.band).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "task claim failed");
                self.stats.database_failure();
                return;
            }
        };
        info!(
            task_id = task.id,
            name = %task.name,
            priority = task.priority,
            "processing task"
        );

        // The task row carries only a reference; the script text lives in the
        // code store.
        let script = match self.store.resolve_code(task.code).await {
            Ok(script) => script,
            Err(e) => {
                error!(task_id = task.id, code = %task.code, error = %e, "failed to resolve code reference");
                self.stats.database_failure();
                return;
            }
        };

        if self.screener.analyze(&script) {
            warn!(task_id = task.id, "script flagged as malicious; refusing execution");
            if let Err(e) = self.store.mark_malicious(task.id).await {
                error!(task_id = task.id, error = %e, "failed to mark task malicious");
                self.stats.database_failure();
            }
            return;
        }

        self.stats.task_started(&task);
        let payload = task.payload.to_string();

        match self.execute_with_retry(task.id, &script, &payload, cancel).await {
            Outcome::Completed(stdout) => {
                match self.store.mark_completed(task.id, &stdout).await {
                    Ok(()) => info!(task_id = task.id, "task completed"),
                    Err(e) => {
                        error!(task_id = task.id, error = %e, "failed to mark task completed");
                        self.stats.database_failure();
                    }
                }
                self.stats.task_succeeded();
            }
            Outcome::Failed(err) => {
                error!(task_id = task.id, error = %err, "task failed after retries");
                let partial_stdout = match &err {
                    SandboxError::ScriptFailed { stdout, .. } if !stdout.is_empty() => {
                        Some(stdout.as_str())
                    }
                    _ => None,
                };
                if let Err(e) = self
                    .store
                    .mark_failed(task.id, &err.to_string(), partial_stdout)
                    .await
                {
                    error!(task_id = task.id, error = %e, "failed to mark task failed");
                    self.stats.database_failure();
                }
                self.stats.task_failed();
            }
            Outcome::Cancelled => {
                // Leave the row as-is: stale recovery reassigns it later.
                info!(task_id = task.id, "execution cancelled mid-task");
            }
        }
        self.stats.clear_current();
    }

    /// Execute with up to [`MAX_ATTEMPTS`] attempts and a short backoff.
    /// Cancellation is checked before every sleep and every new attempt.
    async fn execute_with_retry(
        &self,
        task_id: i32,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut attempt = 1u32;
        loop {
            match self.sandbox.execute(script, payload, cancel).await {
                Ok(stdout) => return Outcome::Completed(stdout),
                Err(SandboxError::Cancelled) => return Outcome::Cancelled,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    warn!(
                        task_id,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %e,
                        "execution attempt failed"
                    );
                    if attempt >= MAX_ATTEMPTS {
                        return Outcome::Failed(e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Outcome::Cancelled,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::screener::PatternScreener;
    use crate::task::{Task, TaskStatus};

    // ── Mock store ───────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockState {
        pending: VecDeque<Task>,
        codes: HashMap<Uuid, String>,
        completed: Vec<(i32, String)>,
        failed: Vec<(i32, String, Option<String>)>,
        malicious: Vec<i32>,
        recover_calls: u32,
        fail_claims: bool,
        fail_marks: bool,
    }

    #[derive(Clone, Default)]
    struct MockStore {
        state: Arc<Mutex<MockState>>,
    }

    impl MockStore {
        fn push_task(&self, id: i32, priority: i32, script: &str) {
            let code = Uuid::new_v4();
            let mut state = self.state.lock().unwrap();
            state.codes.insert(code, script.to_owned());
            state.pending.push_back(Task {
                id,
                name: format!("task-{id}"),
                description: None,
                started: None,
                finished: None,
                locked_at: None,
                last_error: None,
                priority,
                status: TaskStatus::Pending,
                payload: serde_json::json!({}),
                code,
                worker_id: None,
                output: None,
            });
        }

        fn push_task_with_missing_code(&self, id: i32) {
            let mut state = self.state.lock().unwrap();
            state.pending.push_back(Task {
                id,
                name: format!("task-{id}"),
                description: None,
                started: None,
                finished: None,
                locked_at: None,
                last_error: None,
                priority: 0,
                status: TaskStatus::Pending,
                payload: serde_json::json!({}),
                code: Uuid::new_v4(),
                worker_id: None,
                output: None,
            });
        }
    }

    impl TaskStore for MockStore {
        async fn claim_one(
            &self,
            worker_id: &str,
            band: PriorityBand,
        ) -> Result<Option<Task>, sqlx::Error> {
            let mut state = self.state.lock().unwrap();
            if state.fail_claims {
                return Err(sqlx::Error::PoolClosed);
            }
            let position = state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, task)| band.admits(task.priority))
                .min_by_key(|(_, task)| (task.priority, task.id))
                .map(|(position, _)| position);
            Ok(position.and_then(|position| state.pending.remove(position)).map(
                |mut task| {
                    let now = Utc::now();
                    task.status = TaskStatus::Running;
                    task.locked_at = Some(now);
                    task.started = Some(now);
                    task.worker_id = Some(worker_id.to_owned());
                    task
                },
            ))
        }

        async fn resolve_code(&self, code_ref: Uuid) -> Result<String, sqlx::Error> {
            self.state
                .lock()
                .unwrap()
                .codes
                .get(&code_ref)
                .cloned()
                .ok_or(sqlx::Error::RowNotFound)
        }

        async fn mark_malicious(&self, task_id: i32) -> Result<(), sqlx::Error> {
            self.state.lock().unwrap().malicious.push(task_id);
            Ok(())
        }

        async fn mark_completed(&self, task_id: i32, output: &str) -> Result<(), sqlx::Error> {
            let mut state = self.state.lock().unwrap();
            if state.fail_marks {
                return Err(sqlx::Error::PoolClosed);
            }
            state.completed.push((task_id, output.to_owned()));
            Ok(())
        }

        async fn mark_failed(
            &self,
            task_id: i32,
            error: &str,
            output: Option<&str>,
        ) -> Result<(), sqlx::Error> {
            let mut state = self.state.lock().unwrap();
            if state.fail_marks {
                return Err(sqlx::Error::PoolClosed);
            }
            state
                .failed
                .push((task_id, error.to_owned(), output.map(str::to_owned)));
            Ok(())
        }

        async fn recover_stale(&self) -> Result<u64, sqlx::Error> {
            self.state.lock().unwrap().recover_calls += 1;
            Ok(0)
        }
    }

    // ── Mock sandbox ─────────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct MockSandbox {
        calls: Arc<AtomicU32>,
        outcomes: Arc<Mutex<VecDeque<Result<String, SandboxError>>>>,
        cancel_on_call: bool,
    }

    impl MockSandbox {
        fn scripted(
            outcomes: impl IntoIterator<Item = Result<String, SandboxError>>,
        ) -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
                cancel_on_call: false,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ScriptSandbox for MockSandbox {
        async fn execute(
            &self,
            _script: &str,
            _payload: &str,
            cancel: &CancellationToken,
        ) -> Result<String, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.cancel_on_call {
                cancel.cancel();
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(String::new()))
        }
    }

    fn setup_failure() -> SandboxError {
        SandboxError::Setup {
            detail: "transient".to_owned(),
        }
    }

    fn make_worker(
        store: MockStore,
        sandbox: MockSandbox,
        screener: PatternScreener,
    ) -> (Worker<MockStore, MockSandbox, PatternScreener>, Arc<WorkerStats>) {
        let id = Uuid::new_v4();
        let stats = Arc::new(WorkerStats::new(id));
        let worker = Worker::new(
            id,
            store,
            Arc::new(sandbox),
            screener,
            Arc::clone(&stats),
            PriorityBand::default(),
            Duration::from_secs(5),
        );
        (worker, stats)
    }

    // ── Poll interval clamp ──────────────────────────────────────────────────

    #[test]
    fn poll_interval_is_floor_clamped() {
        assert_eq!(
            effective_poll_interval(Duration::ZERO),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_poll_interval(Duration::from_secs(1)),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_poll_interval(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_poll_interval(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    // ── Claim-and-process cycle ──────────────────────────────────────────────

    #[tokio::test]
    async fn completes_task_and_records_output() {
        let store = MockStore::default();
        store.push_task(1, 0, "print(\"hi\")");
        let sandbox = MockSandbox::scripted([Ok("hi\n".to_owned())]);
        let (worker, stats) = make_worker(store.clone(), sandbox.clone(), PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        let state = store.state.lock().unwrap();
        assert_eq!(state.completed, vec![(1, "hi\n".to_owned())]);
        assert!(state.failed.is_empty());
        assert_eq!(state.recover_calls, 1);
        drop(state);

        assert_eq!(sandbox.calls(), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.tasks_processed, 1);
        assert_eq!(snap.tasks_successful, 1);
        assert_eq!(snap.tasks_failed, 0);
        assert!(snap.current_task.is_none());
    }

    #[tokio::test]
    async fn malicious_script_short_circuits_without_sandbox_use() {
        let store = MockStore::default();
        store.push_task(2, 0, "payload = '__pwn__'");
        let sandbox = MockSandbox::default();
        let screener = PatternScreener::new(["__pwn__"]);
        let (worker, stats) = make_worker(store.clone(), sandbox.clone(), screener);

        worker.wake(&CancellationToken::new()).await;

        let state = store.state.lock().unwrap();
        assert_eq!(state.malicious, vec![2]);
        assert!(state.completed.is_empty());
        assert!(state.failed.is_empty());
        drop(state);

        assert_eq!(sandbox.calls(), 0, "malicious task must not reach the sandbox");
        assert_eq!(stats.snapshot().tasks_processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_are_retried_until_success() {
        let store = MockStore::default();
        store.push_task(3, 0, "print(1)");
        let sandbox = MockSandbox::scripted([
            Err(setup_failure()),
            Err(setup_failure()),
            Ok("done\n".to_owned()),
        ]);
        let (worker, stats) = make_worker(store.clone(), sandbox.clone(), PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        assert_eq!(sandbox.calls(), 3);
        let state = store.state.lock().unwrap();
        assert_eq!(state.completed, vec![(3, "done\n".to_owned())]);
        assert!(state.failed.is_empty());
        drop(state);
        assert_eq!(stats.snapshot().tasks_successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_failure_with_partial_output() {
        let store = MockStore::default();
        store.push_task(4, 0, "print(1); exit(2)");
        let sandbox = MockSandbox::scripted([
            Err(setup_failure()),
            Err(setup_failure()),
            Err(SandboxError::ScriptFailed {
                exit_code: 2,
                stderr: "boom".to_owned(),
                stdout: "partial\n".to_owned(),
            }),
        ]);
        let (worker, stats) = make_worker(store.clone(), sandbox.clone(), PatternScreener::default());

        let started = tokio::time::Instant::now();
        worker.wake(&CancellationToken::new()).await;

        assert_eq!(sandbox.calls(), 3);
        // Two backoff pauses between three attempts.
        assert!(started.elapsed() >= Duration::from_secs(4));

        let state = store.state.lock().unwrap();
        assert!(state.completed.is_empty());
        assert_eq!(state.failed.len(), 1);
        let (task_id, error, output) = &state.failed[0];
        assert_eq!(*task_id, 4);
        assert!(error.contains("status 2"), "error should carry the exit code: {error}");
        assert_eq!(output.as_deref(), Some("partial\n"));
        drop(state);

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.tasks_successful, 0);
    }

    #[tokio::test]
    async fn cancellation_leaves_task_untouched() {
        let store = MockStore::default();
        store.push_task(5, 0, "print(1)");
        let sandbox = MockSandbox {
            cancel_on_call: true,
            ..MockSandbox::scripted([Err(setup_failure())])
        };
        let (worker, _stats) = make_worker(store.clone(), sandbox.clone(), PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        assert_eq!(sandbox.calls(), 1, "no retry after cancellation");
        let state = store.state.lock().unwrap();
        assert!(state.completed.is_empty());
        assert!(state.failed.is_empty());
    }

    #[tokio::test]
    async fn one_claim_per_wake() {
        let store = MockStore::default();
        store.push_task(10, 1, "a");
        store.push_task(11, 2, "b");
        store.push_task(12, 3, "c");
        let sandbox = MockSandbox::default();
        let (worker, _stats) = make_worker(store.clone(), sandbox, PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        let state = store.state.lock().unwrap();
        // Lowest priority value claimed first; the rest stay queued.
        assert_eq!(state.completed.len(), 1);
        assert_eq!(state.completed[0].0, 10);
        assert_eq!(state.pending.len(), 2);
    }

    #[tokio::test]
    async fn claim_failure_is_counted_not_fatal() {
        let store = MockStore::default();
        store.state.lock().unwrap().fail_claims = true;
        let sandbox = MockSandbox::default();
        let (worker, stats) = make_worker(store.clone(), sandbox, PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        assert_eq!(stats.snapshot().database_failures, 1);
    }

    #[tokio::test]
    async fn unknown_code_reference_is_counted_not_fatal() {
        let store = MockStore::default();
        store.push_task_with_missing_code(6);
        let sandbox = MockSandbox::default();
        let (worker, stats) = make_worker(store.clone(), sandbox.clone(), PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        assert_eq!(sandbox.calls(), 0);
        assert_eq!(stats.snapshot().database_failures, 1);
    }

    #[tokio::test]
    async fn mark_failure_bumps_database_failures_but_keeps_outcome_counter() {
        let store = MockStore::default();
        store.push_task(7, 0, "print(1)");
        store.state.lock().unwrap().fail_marks = true;
        let sandbox = MockSandbox::scripted([Ok("out\n".to_owned())]);
        let (worker, stats) = make_worker(store.clone(), sandbox, PatternScreener::default());

        worker.wake(&CancellationToken::new()).await;

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_successful, 1);
        assert_eq!(snap.database_failures, 1);
    }
}
