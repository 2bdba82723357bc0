use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use jobrun_core::{JobRef, Run, RunError, RunId, RunStatus, ServerId, StoreFault};

use super::clock::{Clock, SystemClock};
use super::store::{RunStore, RunTransition, RunTx};

/// Store operations that can be made to fail in tests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Begin,
    Commit,
    ClaimDueJobs,
    TransitionRun,
    SetNextScheduledRun,
    InterruptStaleRuns,
    LookupRun,
    DeleteRun,
}

impl StoreOp {
    fn op_name(&self) -> &'static str {
        match self {
            StoreOp::Begin => "in_memory_run_store.begin",
            StoreOp::Commit => "in_memory_run_store.commit",
            StoreOp::ClaimDueJobs => "in_memory_run_store.claim_due_jobs",
            StoreOp::TransitionRun => "in_memory_run_store.transition_run",
            StoreOp::SetNextScheduledRun => "in_memory_run_store.set_next_scheduled_run",
            StoreOp::InterruptStaleRuns => "in_memory_run_store.interrupt_stale_runs",
            StoreOp::LookupRun => "in_memory_run_store.lookup_run",
            StoreOp::DeleteRun => "in_memory_run_store.delete_run",
        }
    }
}

type JobKey = (String, String);

#[derive(Debug, Default, Clone)]
struct State {
    runs: HashMap<RunId, Run>,
    jobs: BTreeMap<JobKey, JobRef>,
}

type FaultQueue = Mutex<Vec<(StoreOp, StoreFault)>>;

fn take_fault(faults: &FaultQueue, op: StoreOp) -> Result<(), RunError> {
    let mut faults = faults.lock().unwrap_or_else(PoisonError::into_inner);
    match faults.iter().position(|(at, _)| *at == op) {
        Some(idx) => {
            let (_, fault) = faults.remove(idx);
            Err(RunError::store(op.op_name(), fault))
        }
        None => Ok(()),
    }
}

/// In-memory run store.
///
/// Intended for tests/dev. Transactions are serialisable: each one works on a
/// private copy of the state that replaces the shared state only on commit.
#[derive(Debug)]
pub struct InMemoryRunStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    faults: FaultQueue,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Register or replace a job definition.
    pub fn upsert_job(&self, job: JobRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .jobs
            .insert((job.plugin_id.clone(), job.name.clone()), job);
    }

    pub fn job(&self, plugin_id: &str, name: &str) -> Option<JobRef> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .jobs
            .get(&(plugin_id.to_string(), name.to_string()))
            .cloned()
    }

    /// Drop a job definition, leaving its runs in place.
    pub fn remove_job(&self, plugin_id: &str, name: &str) -> Option<JobRef> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .jobs
            .remove(&(plugin_id.to_string(), name.to_string()))
    }

    /// Every stored run, oldest first.
    pub fn runs(&self) -> Vec<Run> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut runs: Vec<_> = state.runs.values().cloned().collect();
        runs.sort_by_key(|r| (r.create_time, r.private_id));
        runs
    }

    /// Make the next `op` fail with `fault`. Faults queue per operation.
    pub fn inject_fault(&self, op: StoreOp, fault: StoreFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((op, fault));
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore for InMemoryRunStore {
    fn transact<T, F>(&self, work: F) -> Result<T, RunError>
    where
        F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>,
    {
        take_fault(&self.faults, StoreOp::Begin)?;

        // Shared state is only replaced on commit, so a unit of work that
        // panicked left it intact.
        let mut shared = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let mut draft = shared.clone();
        let value = {
            let mut tx = InMemoryTx {
                state: &mut draft,
                now: self.clock.now(),
                faults: &self.faults,
            };
            work(&mut tx)?
        };

        take_fault(&self.faults, StoreOp::Commit)?;
        *shared = draft;
        Ok(value)
    }

    fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        take_fault(&self.faults, StoreOp::LookupRun)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.runs.get(&run_id).cloned())
    }
}

struct InMemoryTx<'a> {
    state: &'a mut State,
    now: DateTime<Utc>,
    faults: &'a FaultQueue,
}

impl InMemoryTx<'_> {
    fn has_running_run(&self, job: &JobRef) -> bool {
        self.state
            .runs
            .values()
            .any(|r| r.is_running() && r.executes(job))
    }

    fn finish(run: &mut Run, status: RunStatus, now: DateTime<Utc>) {
        run.status = status;
        run.end_time = Some(now);
        run.update_time = now;
    }
}

impl RunTx for InMemoryTx<'_> {
    fn claim_due_jobs(&mut self, server_id: &ServerId, limit: u32) -> Result<Vec<Run>, RunError> {
        take_fault(self.faults, StoreOp::ClaimDueJobs)?;

        let mut due: Vec<JobRef> = self
            .state
            .jobs
            .values()
            .filter(|job| job.is_due(self.now) && !self.has_running_run(job))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_scheduled_run
                .cmp(&b.next_scheduled_run)
                .then_with(|| (&a.plugin_id, &a.name).cmp(&(&b.plugin_id, &b.name)))
        });
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for job in due {
            let run = Run::claimed(RunId::new(), &job, server_id.clone(), self.now);
            self.state.runs.insert(run.private_id, run.clone());
            claimed.push(run);
        }
        Ok(claimed)
    }

    fn transition_run(
        &mut self,
        run_id: RunId,
        transition: RunTransition,
    ) -> Result<Vec<Run>, RunError> {
        take_fault(self.faults, StoreOp::TransitionRun)?;

        let now = self.now;
        let Some(run) = self.state.runs.get_mut(&run_id).filter(|r| r.is_running()) else {
            return Ok(Vec::new());
        };

        match transition {
            RunTransition::Progress { completed, total } => {
                run.completed_count = completed;
                run.total_count = total;
                run.update_time = now;
            }
            RunTransition::Complete => Self::finish(run, RunStatus::Completed, now),
            RunTransition::Fail => Self::finish(run, RunStatus::Failed, now),
        }
        Ok(vec![run.clone()])
    }

    fn set_next_scheduled_run(
        &mut self,
        plugin_id: &str,
        job_name: &str,
        next_run_in_secs: i64,
    ) -> Result<Vec<JobRef>, RunError> {
        take_fault(self.faults, StoreOp::SetNextScheduledRun)?;

        let key = (plugin_id.to_string(), job_name.to_string());
        match self.state.jobs.get_mut(&key) {
            Some(job) => {
                job.next_scheduled_run = chrono::Duration::try_seconds(next_run_in_secs)
                    .and_then(|delay| self.now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        RunError::invalid_parameter(
                            StoreOp::SetNextScheduledRun.op_name(),
                            format!("next run in {next_run_in_secs}s is out of range"),
                        )
                    })?;
                Ok(vec![job.clone()])
            }
            None => Ok(Vec::new()),
        }
    }

    fn interrupt_stale_runs(
        &mut self,
        threshold_secs: i64,
        server_id: Option<&ServerId>,
    ) -> Result<Vec<Run>, RunError> {
        take_fault(self.faults, StoreOp::InterruptStaleRuns)?;

        let now = self.now;
        // A threshold reaching past the earliest representable time makes
        // nothing stale.
        let cutoff = chrono::Duration::try_seconds(threshold_secs)
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut interrupted: Vec<Run> = self
            .state
            .runs
            .values_mut()
            .filter(|r| {
                r.is_running()
                    && r.update_time < cutoff
                    && server_id.is_none_or(|s| &r.server_id == s)
            })
            .map(|r| {
                Self::finish(r, RunStatus::Interrupted, now);
                r.clone()
            })
            .collect();
        interrupted.sort_by_key(|r| (r.create_time, r.private_id));
        Ok(interrupted)
    }

    fn lookup_run(&mut self, run_id: RunId) -> Result<Option<Run>, RunError> {
        take_fault(self.faults, StoreOp::LookupRun)?;
        Ok(self.state.runs.get(&run_id).cloned())
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<u64, RunError> {
        take_fault(self.faults, StoreOp::DeleteRun)?;
        Ok(u64::from(self.state.runs.remove(&run_id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::clock::ManualClock;

    fn store_with_jobs(clock: Arc<ManualClock>, jobs: &[(&str, i64)]) -> InMemoryRunStore {
        let store = InMemoryRunStore::with_clock(clock.clone());
        for (name, offset_secs) in jobs {
            store.upsert_job(JobRef::new(
                "pi_test",
                *name,
                clock.now() + chrono::Duration::seconds(*offset_secs),
            ));
        }
        store
    }

    #[test]
    fn claims_only_due_jobs_in_schedule_order() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("later", 60), ("second", -10), ("first", -20)]);
        let server = ServerId::from("srv-1");

        let runs = store
            .transact(|tx| tx.claim_due_jobs(&server, 10))
            .unwrap();

        let names: Vec<_> = runs.iter().map(|r| r.job_name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert!(runs.iter().all(|r| r.server_id == server && r.is_running()));
    }

    #[test]
    fn job_with_a_running_run_is_not_claimed_again() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("only", -1)]);
        let server = ServerId::from("srv-1");

        let first = store.transact(|tx| tx.claim_due_jobs(&server, 1)).unwrap();
        let second = store.transact(|tx| tx.claim_due_jobs(&server, 1)).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn failed_unit_of_work_leaves_no_trace() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("only", -1)]);
        let server = ServerId::from("srv-1");

        let err = store
            .transact(|tx| -> Result<(), RunError> {
                tx.claim_due_jobs(&server, 1)?;
                Err(RunError::invalid_parameter("test", "abort"))
            })
            .unwrap_err();

        assert!(matches!(err, RunError::InvalidParameter { .. }));
        assert!(store.runs().is_empty());
    }

    #[test]
    fn commit_fault_rolls_back() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("only", -1)]);
        store.inject_fault(StoreOp::Commit, StoreFault::serialization_conflict("40001"));

        let err = store
            .transact(|tx| tx.claim_due_jobs(&ServerId::from("srv-1"), 1))
            .unwrap_err();

        assert!(err.is_transient());
        assert!(store.runs().is_empty());
    }

    #[test]
    fn transition_only_matches_running_runs() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("only", -1)]);
        let run = store
            .transact(|tx| tx.claim_due_jobs(&ServerId::from("srv-1"), 1))
            .unwrap()
            .remove(0);

        let done = store
            .transact(|tx| tx.transition_run(run.private_id, RunTransition::Fail))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, RunStatus::Failed);
        assert!(done[0].end_time.is_some());

        let again = store
            .transact(|tx| tx.transition_run(run.private_id, RunTransition::Complete))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn panicking_unit_of_work_does_not_wedge_the_store() {
        let clock = Arc::new(ManualClock::default());
        let store = store_with_jobs(clock, &[("only", -1)]);
        let server = ServerId::from("srv-1");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = store.transact(|tx| -> Result<(), RunError> {
                tx.claim_due_jobs(&server, 1)?;
                panic!("handler bug");
            });
        }));
        assert!(outcome.is_err());

        assert!(store.runs().is_empty());
        let claimed = store.transact(|tx| tx.claim_due_jobs(&server, 1)).unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn injected_faults_fire_once_per_operation() {
        let store = InMemoryRunStore::new();
        store.inject_fault(StoreOp::LookupRun, StoreFault::connection_lost("reset"));

        assert!(store.lookup_run(RunId::new()).is_err());
        assert!(store.lookup_run(RunId::new()).unwrap().is_none());
    }
}
