//! Store boundary for job runs.
//!
//! The repository never talks to a database directly. It hands units of work
//! to a [`RunStore`], which runs them inside one transaction against a
//! [`RunTx`]. Every mutating `RunTx` operation is a single predicated
//! statement at the store (compare-and-swap on `status = running`), never a
//! read followed by a write in application code.

use std::sync::Arc;

use jobrun_core::{JobRef, Run, RunError, RunId, ServerId};

/// A conditional state change applied to a single running run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    /// Record progress; the run stays `running`.
    Progress { completed: u32, total: u32 },
    /// `running -> completed`, stamping `end_time`.
    Complete,
    /// `running -> failed`, stamping `end_time`.
    Fail,
}

/// Operations available inside a store transaction.
///
/// Timestamps come from the store clock, never from the caller.
pub trait RunTx {
    /// Create one running run per due, unclaimed job (at most `limit`) for
    /// `server_id`, skipping jobs another transaction holds locked.
    fn claim_due_jobs(&mut self, server_id: &ServerId, limit: u32) -> Result<Vec<Run>, RunError>;

    /// Apply `transition` where `private_id = run_id AND status = running`.
    ///
    /// Returns every affected row: empty when the predicate matched nothing.
    fn transition_run(
        &mut self,
        run_id: RunId,
        transition: RunTransition,
    ) -> Result<Vec<Run>, RunError>;

    /// Set the job's next scheduled run to `now + next_run_in_secs`.
    ///
    /// Returns every affected job row.
    fn set_next_scheduled_run(
        &mut self,
        plugin_id: &str,
        job_name: &str,
        next_run_in_secs: i64,
    ) -> Result<Vec<JobRef>, RunError>;

    /// Mark every running run last updated before `now - threshold_secs` as
    /// interrupted, optionally only those leased by `server_id`.
    fn interrupt_stale_runs(
        &mut self,
        threshold_secs: i64,
        server_id: Option<&ServerId>,
    ) -> Result<Vec<Run>, RunError>;

    fn lookup_run(&mut self, run_id: RunId) -> Result<Option<Run>, RunError>;

    /// Delete by primary key regardless of status; returns rows removed.
    fn delete_run(&mut self, run_id: RunId) -> Result<u64, RunError>;
}

/// Transactional run store.
///
/// Implementations must:
/// - commit the unit of work only when it returns `Ok`, and roll back otherwise
/// - classify driver failures into [`jobrun_core::FaultClass`] so transient
///   faults can be retried
/// - never cache run state between calls
pub trait RunStore: Send + Sync {
    fn transact<T, F>(&self, work: F) -> Result<T, RunError>
    where
        F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>;

    /// Point read outside of any transaction.
    fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError>;
}

impl<S> RunStore for Arc<S>
where
    S: RunStore,
{
    fn transact<T, F>(&self, work: F) -> Result<T, RunError>
    where
        F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>,
    {
        (**self).transact(work)
    }

    fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        (**self).lookup_run(run_id)
    }
}

/// Round a duration to whole seconds, halves away from zero.
pub fn round_to_secs(d: std::time::Duration) -> i64 {
    let nanos = d.as_nanos() + 500_000_000;
    i64::try_from(nanos / 1_000_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rounds_to_nearest_second() {
        assert_eq!(round_to_secs(Duration::ZERO), 0);
        assert_eq!(round_to_secs(Duration::from_millis(499)), 0);
        assert_eq!(round_to_secs(Duration::from_millis(500)), 1);
        assert_eq!(round_to_secs(Duration::from_millis(1_499)), 1);
        assert_eq!(round_to_secs(Duration::from_secs(3_600)), 3_600);
    }
}
