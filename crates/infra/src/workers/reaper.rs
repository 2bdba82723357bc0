//! Stale-run reaper.
//!
//! A worker that stops reporting progress for longer than the threshold is
//! presumed dead; its runs are interrupted so the job becomes claimable again
//! once it is next due.

use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use jobrun_core::{Run, RunError, ServerId};

use crate::retry::CancelToken;
use crate::runs::{RunRepository, RunStore};

use super::WorkerHandle;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub name: String,
    /// Runs not updated within this long are interrupted
    pub threshold: Duration,
    /// Wait between passes
    pub interval: Duration,
    /// Only reap runs leased by this server
    pub server_id: Option<ServerId>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            name: "run-reaper".to_string(),
            threshold: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            server_id: None,
        }
    }
}

impl ReaperConfig {
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }
}

pub struct Reaper<S> {
    repo: RunRepository<S>,
    config: ReaperConfig,
}

impl<S: RunStore + 'static> Reaper<S> {
    pub fn new(repo: RunRepository<S>, config: ReaperConfig) -> Self {
        Self { repo, config }
    }

    /// One reclamation pass.
    pub fn reap_once(&self) -> Result<Vec<Run>, RunError> {
        let runs = self
            .repo
            .interrupt_runs(self.config.threshold, self.config.server_id.as_ref())?;
        for run in &runs {
            warn!(
                reaper = %self.config.name,
                run_id = %run.private_id,
                server_id = %run.server_id,
                plugin_id = %run.job_plugin_id,
                job = %run.job_name,
                "interrupted stale run"
            );
        }
        Ok(runs)
    }

    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let cancel = CancelToken::new();
        let reaper = Reaper {
            repo: self.repo.with_cancellation(cancel.clone()),
            config: self.config,
        };
        let name = reaper.config.name.clone();
        let loop_cancel = cancel.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reaper.run_loop(&loop_cancel))?;

        Ok(WorkerHandle::new(name, cancel, join))
    }

    fn run_loop(&self, cancel: &CancelToken) {
        info!(
            reaper = %self.config.name,
            threshold_secs = self.config.threshold.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "run reaper started"
        );

        loop {
            match self.reap_once() {
                Ok(runs) if !runs.is_empty() => {
                    info!(reaper = %self.config.name, count = runs.len(), "reaped stale runs");
                }
                Ok(_) => {}
                Err(RunError::Cancelled { .. }) => break,
                Err(err) => error!(reaper = %self.config.name, error = %err, "reaper pass failed"),
            }
            if !cancel.sleep(self.config.interval) {
                break;
            }
        }

        info!(reaper = %self.config.name, "run reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use jobrun_core::{JobRef, RunStatus};

    use crate::runs::{Clock, InMemoryRunStore, ManualClock};

    fn setup() -> (Arc<ManualClock>, RunRepository<InMemoryRunStore>) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryRunStore::with_clock(clock.clone());
        store.upsert_job(JobRef::new("pi_a", "one", clock.now()));
        store.upsert_job(JobRef::new("pi_a", "two", clock.now()));
        (clock, RunRepository::new(store))
    }

    #[test]
    fn reaps_only_runs_of_the_configured_server() {
        let (clock, repo) = setup();
        let mine = repo.run_jobs(&ServerId::from("srv-dead"), None).unwrap().remove(0);
        let theirs = repo.run_jobs(&ServerId::from("srv-live"), None).unwrap().remove(0);
        clock.advance(chrono::Duration::minutes(10));

        let reaper = Reaper::new(
            repo.clone(),
            ReaperConfig::default()
                .with_threshold(Duration::from_secs(60))
                .with_server(ServerId::from("srv-dead")),
        );
        let reaped = reaper.reap_once().unwrap();

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].private_id, mine.private_id);
        let theirs = repo.lookup_run(theirs.private_id).unwrap().unwrap();
        assert_eq!(theirs.status, RunStatus::Running);
    }

    #[test]
    fn spawned_reaper_runs_immediately_and_stops_on_shutdown() {
        let (clock, repo) = setup();
        let run = repo.run_jobs(&ServerId::from("srv-1"), None).unwrap().remove(0);
        clock.advance(chrono::Duration::minutes(10));

        let handle = Reaper::new(
            repo.clone(),
            ReaperConfig::default().with_interval(Duration::from_secs(30)),
        )
        .spawn()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while repo.lookup_run(run.private_id).unwrap().unwrap().is_running()
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            repo.lookup_run(run.private_id).unwrap().unwrap().status,
            RunStatus::Interrupted
        );
    }
}
