//! Run lifecycle state machine.
//!
//! Every mutation runs as one unit of work through [`RetryableTransaction`].
//! Transitions are compare-and-swap on `status = running` at the store; a
//! losing caller sees zero affected rows and gets `NotFound` or
//! `InvalidJobRunState` from a point lookup inside the same transaction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, instrument};

use jobrun_core::{Run, RunError, RunId, ServerId};

use crate::retry::{CancelToken, RetryableTransaction};

use super::events::{RunEventKind, RunEventPublisher};
use super::store::{RunStore, RunTransition, RunTx, round_to_secs};

const OP_RUN_JOBS: &str = "run_repository.run_jobs";
const OP_UPDATE_PROGRESS: &str = "run_repository.update_progress";
const OP_COMPLETE_RUN: &str = "run_repository.complete_run";
const OP_FAIL_RUN: &str = "run_repository.fail_run";
const OP_INTERRUPT_RUNS: &str = "run_repository.interrupt_runs";
const OP_LOOKUP_RUN: &str = "run_repository.lookup_run";
const OP_DELETE_RUN: &str = "run_repository.delete_run";

/// Claim limit used when the caller passes none, zero, or a negative value.
pub const DEFAULT_RUN_JOBS_LIMIT: u32 = 1;

/// Repository over job runs.
///
/// Holds no run state of its own: every call reads through to the store.
pub struct RunRepository<S> {
    store: Arc<S>,
    retry: RetryableTransaction,
    cancel: CancelToken,
    events: Option<RunEventPublisher>,
}

impl<S> Clone for RunRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S> std::fmt::Debug for RunRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRepository")
            .field("retry", &self.retry)
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: RunStore> RunRepository<S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryableTransaction::default(),
            cancel: CancelToken::new(),
            events: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryableTransaction) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: RunEventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// A view of this repository whose retries observe `cancel`.
    pub fn with_cancellation(&self, cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cancellation(&self) -> &CancelToken {
        &self.cancel
    }

    /// Claim up to `limit` due jobs as running runs leased by `server_id`.
    ///
    /// `None` or a non-positive limit claims one. Nothing due is an empty
    /// result, not an error.
    #[instrument(skip(self, server_id), fields(server_id = %server_id), err)]
    pub fn run_jobs(&self, server_id: &ServerId, limit: Option<i32>) -> Result<Vec<Run>, RunError> {
        if server_id.is_empty() {
            return Err(RunError::invalid_parameter(OP_RUN_JOBS, "missing server id"));
        }
        let limit = match limit {
            Some(n) if n > 0 => n as u32,
            _ => DEFAULT_RUN_JOBS_LIMIT,
        };

        let runs = self
            .retry
            .run(self.store.as_ref(), &self.cancel, OP_RUN_JOBS, |tx| {
                tx.claim_due_jobs(server_id, limit)
            })?;

        self.publish(RunEventKind::Claimed, &runs);
        Ok(runs)
    }

    /// Record progress on a running run.
    #[instrument(skip(self, run_id), fields(run_id = %run_id), err)]
    pub fn update_progress(&self, run_id: RunId, completed: u32, total: u32) -> Result<Run, RunError> {
        require_run_id(OP_UPDATE_PROGRESS, run_id)?;

        self.retry
            .run(self.store.as_ref(), &self.cancel, OP_UPDATE_PROGRESS, |tx| {
                let rows = tx.transition_run(run_id, RunTransition::Progress { completed, total })?;
                expect_single_run(tx, OP_UPDATE_PROGRESS, run_id, rows)
            })
    }

    /// Mark a running run completed and schedule its job `next_run_in` from
    /// now (rounded to the second). Both changes commit together.
    #[instrument(skip(self, run_id), fields(run_id = %run_id), err)]
    pub fn complete_run(&self, run_id: RunId, next_run_in: Duration) -> Result<Run, RunError> {
        require_run_id(OP_COMPLETE_RUN, run_id)?;
        let next_run_in_secs = round_to_secs(next_run_in);

        let run = self
            .retry
            .run(self.store.as_ref(), &self.cancel, OP_COMPLETE_RUN, |tx| {
                let rows = tx.transition_run(run_id, RunTransition::Complete)?;
                let run = expect_single_run(tx, OP_COMPLETE_RUN, run_id, rows)?;

                let jobs = tx.set_next_scheduled_run(
                    &run.job_plugin_id,
                    &run.job_name,
                    next_run_in_secs,
                )?;
                if jobs.len() > 1 {
                    error!(
                        op = OP_COMPLETE_RUN,
                        %run_id,
                        rows = jobs.len(),
                        "job key matched more than one job"
                    );
                    return Err(RunError::multiple_records(
                        OP_COMPLETE_RUN,
                        format!("more than 1 job would have been updated: {}", jobs.len()),
                    ));
                }
                Ok(run)
            })?;

        self.publish(RunEventKind::Completed, std::slice::from_ref(&run));
        Ok(run)
    }

    /// Mark a running run failed.
    #[instrument(skip(self, run_id), fields(run_id = %run_id), err)]
    pub fn fail_run(&self, run_id: RunId) -> Result<Run, RunError> {
        require_run_id(OP_FAIL_RUN, run_id)?;

        let run = self
            .retry
            .run(self.store.as_ref(), &self.cancel, OP_FAIL_RUN, |tx| {
                let rows = tx.transition_run(run_id, RunTransition::Fail)?;
                expect_single_run(tx, OP_FAIL_RUN, run_id, rows)
            })?;

        self.publish(RunEventKind::Failed, std::slice::from_ref(&run));
        Ok(run)
    }

    /// Interrupt every running run not updated within `threshold`,
    /// optionally only those leased by `server_id`.
    #[instrument(skip(self, server_id), fields(server_id = ?server_id.map(ServerId::as_str)), err)]
    pub fn interrupt_runs(
        &self,
        threshold: Duration,
        server_id: Option<&ServerId>,
    ) -> Result<Vec<Run>, RunError> {
        if server_id.is_some_and(ServerId::is_empty) {
            return Err(RunError::invalid_parameter(
                OP_INTERRUPT_RUNS,
                "server id filter is empty",
            ));
        }
        let threshold_secs = round_to_secs(threshold);

        let runs = self
            .retry
            .run(self.store.as_ref(), &self.cancel, OP_INTERRUPT_RUNS, |tx| {
                tx.interrupt_stale_runs(threshold_secs, server_id)
            })?;

        self.publish(RunEventKind::Interrupted, &runs);
        Ok(runs)
    }

    /// Point read. Absence is `Ok(None)`, never an error.
    #[instrument(skip(self, run_id), fields(run_id = %run_id), err)]
    pub fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        require_run_id(OP_LOOKUP_RUN, run_id)?;
        self.store.lookup_run(run_id)
    }

    /// Delete a run regardless of status. Returns rows removed.
    #[instrument(skip(self, run_id), fields(run_id = %run_id), err)]
    pub fn delete_run(&self, run_id: RunId) -> Result<u64, RunError> {
        require_run_id(OP_DELETE_RUN, run_id)?;

        self.retry
            .run(self.store.as_ref(), &self.cancel, OP_DELETE_RUN, |tx| {
                let deleted = tx.delete_run(run_id)?;
                if deleted > 1 {
                    error!(op = OP_DELETE_RUN, %run_id, rows = deleted, "run id matched more than one run");
                    return Err(RunError::multiple_records(
                        OP_DELETE_RUN,
                        format!("more than 1 job run would have been deleted: {deleted}"),
                    ));
                }
                Ok(deleted)
            })
    }

    fn publish(&self, kind: RunEventKind, runs: &[Run]) {
        if let Some(events) = &self.events {
            if !runs.is_empty() {
                events.publish(kind, runs);
            }
        }
    }
}

fn require_run_id(op: &'static str, run_id: RunId) -> Result<(), RunError> {
    if run_id.is_nil() {
        return Err(RunError::invalid_parameter(op, "missing run id"));
    }
    Ok(())
}

/// Resolve the rows returned by a conditional transition.
///
/// Zero rows means the run is missing or no longer running; the point lookup
/// runs in the same transaction so the status it reports is the one that
/// defeated the predicate.
fn expect_single_run(
    tx: &mut dyn RunTx,
    op: &'static str,
    run_id: RunId,
    mut rows: Vec<Run>,
) -> Result<Run, RunError> {
    match rows.len() {
        1 => Ok(rows.remove(0)),
        0 => match tx.lookup_run(run_id)? {
            None => Err(RunError::NotFound { op, run_id }),
            Some(run) => Err(RunError::InvalidJobRunState {
                op,
                run_id,
                status: run.status,
            }),
        },
        n => {
            error!(op, %run_id, rows = n, "run id matched more than one run");
            Err(RunError::multiple_records(
                op,
                format!("more than 1 job run would have been updated: {n}"),
            ))
        }
    }
}
