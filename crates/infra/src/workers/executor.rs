//! Run executor: scheduler driver and worker in one loop.
//!
//! Each tick claims due jobs for this server, runs the registered handler for
//! each claimed run, and finalises it. A run whose progress or finalisation
//! call reports `InvalidJobRunState` was reclaimed by the reaper; the executor
//! stops working on it and leaves it alone.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobrun_core::{Run, RunError, ServerId};

use crate::retry::CancelToken;
use crate::runs::{RunRepository, RunStore};

use super::WorkerHandle;

/// Handler registered for a job.
pub type RunHandler = Box<dyn Fn(&RunContext<'_>) -> RunOutcome + Send + Sync>;

/// Job name that matches every job of a plugin.
pub const ANY_JOB: &str = "*";

/// What a handler reports when it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finished; schedule the job again after `next_run_in`.
    Completed { next_run_in: Duration },
    /// Finished with an error.
    Failed(String),
}

impl RunOutcome {
    pub fn completed(next_run_in: Duration) -> Self {
        Self::Completed { next_run_in }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Explicit handler registry, keyed by plugin id and job name.
///
/// Built once at startup and shared read-only with executors.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), RunHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &keys)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `plugin_id`/`job_name`. Use [`ANY_JOB`] as the
    /// job name to cover every job of the plugin without its own handler.
    pub fn register<F>(&mut self, plugin_id: impl Into<String>, job_name: impl Into<String>, handler: F)
    where
        F: Fn(&RunContext<'_>) -> RunOutcome + Send + Sync + 'static,
    {
        self.handlers
            .insert((plugin_id.into(), job_name.into()), Box::new(handler));
    }

    pub fn with<F>(mut self, plugin_id: impl Into<String>, job_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RunContext<'_>) -> RunOutcome + Send + Sync + 'static,
    {
        self.register(plugin_id, job_name, handler);
        self
    }

    /// Exact match first, then the plugin's `*` handler.
    pub fn get(&self, plugin_id: &str, job_name: &str) -> Option<&RunHandler> {
        self.handlers
            .get(&(plugin_id.to_string(), job_name.to_string()))
            .or_else(|| self.handlers.get(&(plugin_id.to_string(), ANY_JOB.to_string())))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

type ProgressFn<'a> = dyn Fn(u32, u32) -> Result<Run, RunError> + 'a;

/// What a handler sees of the run it is executing.
pub struct RunContext<'a> {
    run: &'a Run,
    progress: &'a ProgressFn<'a>,
    cancel: &'a CancelToken,
    reclaimed: Cell<bool>,
}

impl<'a> RunContext<'a> {
    fn new(run: &'a Run, progress: &'a ProgressFn<'a>, cancel: &'a CancelToken) -> Self {
        Self {
            run,
            progress,
            cancel,
            reclaimed: Cell::new(false),
        }
    }

    pub fn run(&self) -> &Run {
        self.run
    }

    /// Record progress.
    ///
    /// An `InvalidJobRunState` error means the run was reclaimed; the handler
    /// should stop and return whatever outcome it likes, it will be ignored.
    pub fn report_progress(&self, completed: u32, total: u32) -> Result<(), RunError> {
        match (self.progress)(completed, total) {
            Ok(_) => Ok(()),
            Err(err @ RunError::InvalidJobRunState { .. }) => {
                self.reclaimed.set(true);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn was_reclaimed(&self) -> bool {
        self.reclaimed.get()
    }

    /// True once the run was reclaimed or the executor is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.was_reclaimed() || self.cancel.is_cancelled()
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Thread name and log field
    pub name: String,
    /// Identity used for claims
    pub server_id: ServerId,
    /// Max runs claimed per tick; non-positive claims one
    pub run_jobs_limit: i32,
    /// Wait between ticks that claimed nothing
    pub poll_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            name: "run-executor".to_string(),
            server_id,
            run_jobs_limit: 1,
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_run_jobs_limit(mut self, limit: i32) -> Self {
        self.run_jobs_limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub runs_claimed: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    /// Reclaimed before this executor could finalise them
    pub runs_abandoned: u64,
    pub claim_errors: u64,
    pub finalize_errors: u64,
    pub uptime_secs: u64,
}

/// Background run executor.
pub struct RunExecutor<S> {
    repo: RunRepository<S>,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: RunStore + 'static> RunExecutor<S> {
    pub fn new(repo: RunRepository<S>, registry: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        Self {
            repo,
            registry,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shared view of the statistics, readable after `spawn`.
    pub fn stats_handle(&self) -> Arc<Mutex<ExecutorStats>> {
        self.stats.clone()
    }

    /// Claim and execute one batch of due runs. Returns how many were claimed.
    pub fn tick(&self) -> Result<usize, RunError> {
        let runs = match self
            .repo
            .run_jobs(&self.config.server_id, Some(self.config.run_jobs_limit))
        {
            Ok(runs) => runs,
            Err(err) => {
                self.record(|s| s.claim_errors += 1);
                return Err(err);
            }
        };

        self.record(|s| s.runs_claimed += runs.len() as u64);
        for run in &runs {
            debug!(
                executor = %self.config.name,
                run_id = %run.private_id,
                plugin_id = %run.job_plugin_id,
                job = %run.job_name,
                "claimed run"
            );
            self.execute(run);
        }
        Ok(runs.len())
    }

    /// Spawn the executor on a named thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let cancel = CancelToken::new();
        let executor = RunExecutor {
            repo: self.repo.with_cancellation(cancel.clone()),
            ..self
        };
        let name = executor.config.name.clone();
        let loop_cancel = cancel.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || executor.run_loop(&loop_cancel))?;

        Ok(WorkerHandle::new(name, cancel, join))
    }

    fn run_loop(&self, cancel: &CancelToken) {
        info!(executor = %self.config.name, server_id = %self.config.server_id, "run executor started");
        let started = Instant::now();

        while !cancel.is_cancelled() {
            let claimed = match self.tick() {
                Ok(claimed) => claimed,
                Err(RunError::Cancelled { .. }) => break,
                Err(err) => {
                    error!(executor = %self.config.name, error = %err, "failed to claim runs");
                    0
                }
            };
            self.record(|s| s.uptime_secs = started.elapsed().as_secs());

            if claimed == 0 && !cancel.sleep(self.config.poll_interval) {
                break;
            }
        }

        info!(executor = %self.config.name, "run executor stopped");
    }

    fn execute(&self, run: &Run) {
        let run_id = run.private_id;

        let Some(handler) = self.registry.get(&run.job_plugin_id, &run.job_name) else {
            warn!(
                executor = %self.config.name,
                %run_id,
                plugin_id = %run.job_plugin_id,
                job = %run.job_name,
                "no handler registered for job; failing run"
            );
            self.finalize(run, self.repo.fail_run(run_id), false);
            return;
        };

        let progress = |completed: u32, total: u32| self.repo.update_progress(run_id, completed, total);
        let ctx = RunContext::new(run, &progress, self.repo.cancellation());
        let outcome = handler(&ctx);

        if ctx.was_reclaimed() {
            info!(executor = %self.config.name, %run_id, "run was reclaimed; abandoning");
            self.record(|s| s.runs_abandoned += 1);
            return;
        }

        match outcome {
            RunOutcome::Completed { next_run_in } => {
                self.finalize(run, self.repo.complete_run(run_id, next_run_in), true);
            }
            RunOutcome::Failed(reason) => {
                warn!(executor = %self.config.name, %run_id, reason = %reason, "run failed");
                self.finalize(run, self.repo.fail_run(run_id), false);
            }
        }
    }

    fn finalize(&self, run: &Run, result: Result<Run, RunError>, completed: bool) {
        match result {
            Ok(_) if completed => self.record(|s| s.runs_completed += 1),
            Ok(_) => self.record(|s| s.runs_failed += 1),
            Err(RunError::InvalidJobRunState { status, .. }) => {
                info!(
                    executor = %self.config.name,
                    run_id = %run.private_id,
                    %status,
                    "run was reclaimed before finalisation"
                );
                self.record(|s| s.runs_abandoned += 1);
            }
            Err(err) => {
                error!(
                    executor = %self.config.name,
                    run_id = %run.private_id,
                    error = %err,
                    "failed to finalise run; leaving it to the reaper"
                );
                self.record(|s| s.finalize_errors += 1);
            }
        }
    }

    fn record(&self, update: impl FnOnce(&mut ExecutorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use jobrun_core::{JobRef, RunStatus};

    use crate::retry::{ConstantBackoff, RetryableTransaction};
    use crate::runs::{Clock, InMemoryRunStore, ManualClock};

    fn repo_with_jobs(jobs: &[(&str, &str)]) -> RunRepository<InMemoryRunStore> {
        let store = InMemoryRunStore::new();
        for (plugin, name) in jobs {
            store.upsert_job(JobRef::new(
                *plugin,
                *name,
                Utc::now() - chrono::Duration::seconds(1),
            ));
        }
        RunRepository::new(store)
            .with_retry(RetryableTransaction::new(2, ConstantBackoff(Duration::from_millis(1))))
    }

    fn executor(
        repo: &RunRepository<InMemoryRunStore>,
        registry: HandlerRegistry,
        limit: i32,
    ) -> RunExecutor<InMemoryRunStore> {
        RunExecutor::new(
            repo.clone(),
            Arc::new(registry),
            ExecutorConfig::new(ServerId::from("srv-1")).with_run_jobs_limit(limit),
        )
    }

    #[test]
    fn registry_prefers_exact_match_over_plugin_fallback() {
        let registry = HandlerRegistry::new()
            .with("pi_a", "sync", |_ctx| RunOutcome::completed(Duration::from_secs(1)))
            .with("pi_a", ANY_JOB, |_ctx| RunOutcome::failed("fallback"));

        let run_with = |name: &str| {
            let now = Utc::now();
            Run::claimed(
                jobrun_core::RunId::new(),
                &JobRef::new("pi_a", name, now),
                ServerId::from("srv-1"),
                now,
            )
        };
        let cancel = CancelToken::new();
        let progress = |_c: u32, _t: u32| -> Result<Run, RunError> { unreachable!() };

        let sync = run_with("sync");
        let ctx = RunContext::new(&sync, &progress, &cancel);
        assert!(matches!(registry.get("pi_a", "sync").unwrap()(&ctx), RunOutcome::Completed { .. }));

        let other = run_with("other");
        let ctx = RunContext::new(&other, &progress, &cancel);
        assert_eq!(registry.get("pi_a", "other").unwrap()(&ctx), RunOutcome::failed("fallback"));

        assert!(registry.get("pi_b", "sync").is_none());
    }

    #[test]
    fn tick_completes_runs_and_reschedules_the_job() {
        let repo = repo_with_jobs(&[("pi_a", "sync")]);
        let registry = HandlerRegistry::new().with("pi_a", "sync", |ctx| {
            ctx.report_progress(10, 10).unwrap();
            RunOutcome::completed(Duration::from_secs(3_600))
        });
        let exec = executor(&repo, registry, 1);

        assert_eq!(exec.tick().unwrap(), 1);

        let runs = repo.store().runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!((runs[0].completed_count, runs[0].total_count), (10, 10));
        let job = repo.store().job("pi_a", "sync").unwrap();
        assert!(job.next_scheduled_run > Utc::now() + chrono::Duration::minutes(59));
        assert_eq!(exec.stats().runs_completed, 1);
    }

    #[test]
    fn run_without_handler_is_failed() {
        let repo = repo_with_jobs(&[("pi_unknown", "sync")]);
        let exec = executor(&repo, HandlerRegistry::new(), 1);

        exec.tick().unwrap();

        assert_eq!(repo.store().runs()[0].status, RunStatus::Failed);
        assert_eq!(exec.stats().runs_failed, 1);
    }

    #[test]
    fn reclaimed_run_is_abandoned_without_finalisation() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryRunStore::with_clock(clock.clone());
        store.upsert_job(JobRef::new("pi_a", "slow", clock.now()));
        let repo = RunRepository::new(store)
            .with_retry(RetryableTransaction::new(2, ConstantBackoff(Duration::from_millis(1))));
        let before = repo.store().job("pi_a", "slow").unwrap();

        let reaper = repo.clone();
        let registry = HandlerRegistry::new().with("pi_a", "slow", move |ctx| {
            clock.advance(chrono::Duration::minutes(10));
            reaper.interrupt_runs(Duration::from_secs(300), None).unwrap();
            assert!(ctx.report_progress(1, 2).is_err());
            assert!(ctx.is_cancelled());
            RunOutcome::completed(Duration::from_secs(60))
        });
        let exec = executor(&repo, registry, 1);

        exec.tick().unwrap();

        let stats = exec.stats();
        assert_eq!(stats.runs_abandoned, 1);
        assert_eq!(stats.runs_completed, 0);
        assert_eq!(repo.store().runs()[0].status, RunStatus::Interrupted);
        assert_eq!(repo.store().job("pi_a", "slow").unwrap(), before);
    }

    #[test]
    fn spawned_executor_stops_on_shutdown() {
        let repo = repo_with_jobs(&[("pi_a", "sync")]);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let registry = HandlerRegistry::new().with("pi_a", ANY_JOB, move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            RunOutcome::completed(Duration::from_secs(3_600))
        });
        let exec = RunExecutor::new(
            repo.clone(),
            Arc::new(registry),
            ExecutorConfig::new(ServerId::from("srv-1"))
                .with_name("test-executor")
                .with_poll_interval(Duration::from_secs(30)),
        );
        let stats = exec.stats_handle();
        let handle = exec.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.lock().unwrap().runs_completed, 1);
    }
}
