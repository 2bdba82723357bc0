//! Transactional unit-of-work execution with bounded retry.

use std::sync::Arc;

use tracing::{debug, warn};

use jobrun_core::RunError;

use crate::runs::store::{RunStore, RunTx};

use super::backoff::{Backoff, ExpBackoff};
use super::cancel::CancelToken;

/// Standard number of retries after the first attempt.
pub const STD_TX_RETRIES: u32 = 20;

/// Runs a unit of work in a store transaction, retrying transient faults.
///
/// A transient fault (see [`RunError::is_transient`]) rolls back, waits
/// `backoff.duration(attempt)` and tries again, for at most `retries + 1`
/// attempts. Every other error, including business outcomes such as
/// `InvalidJobRunState`, aborts at once and is returned unchanged.
#[derive(Clone)]
pub struct RetryableTransaction {
    retries: u32,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for RetryableTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryableTransaction")
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl Default for RetryableTransaction {
    fn default() -> Self {
        Self::new(STD_TX_RETRIES, ExpBackoff::default())
    }
}

impl RetryableTransaction {
    pub fn new(retries: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            retries,
            backoff: Arc::new(backoff),
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn run<S, T, F>(
        &self,
        store: &S,
        cancel: &CancelToken,
        op: &'static str,
        mut work: F,
    ) -> Result<T, RunError>
    where
        S: RunStore + ?Sized,
        F: FnMut(&mut dyn RunTx) -> Result<T, RunError>,
    {
        let mut failures = Vec::new();
        for attempt in 1..=self.retries.saturating_add(1) {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled {
                    op,
                    attempts: attempt - 1,
                    errors: failures,
                });
            }

            match store.transact(&mut work) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    if attempt > self.retries {
                        warn!(op, attempt, error = %err, "transient store error; retries exhausted");
                        failures.push(err);
                        break;
                    }
                    let wait = self.backoff.duration(attempt);
                    warn!(
                        op,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        error = %err,
                        "transient store error; retrying"
                    );
                    failures.push(err);
                    if !cancel.sleep(wait) {
                        return Err(RunError::Cancelled {
                            op,
                            attempts: attempt,
                            errors: failures,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(RunError::MaxRetries {
            op,
            attempts: failures.len() as u32,
            errors: failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use jobrun_core::{ErrorCode, Run, RunId, StoreFault};

    use crate::retry::backoff::ConstantBackoff;

    /// Store whose transactions fail with a scripted sequence of errors.
    struct ScriptedStore {
        calls: AtomicU32,
        failures: std::sync::Mutex<Vec<RunError>>,
    }

    impl ScriptedStore {
        fn failing_with(mut failures: Vec<RunError>) -> Self {
            failures.reverse();
            Self {
                calls: AtomicU32::new(0),
                failures: std::sync::Mutex::new(failures),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct NoopTx;

    impl RunTx for NoopTx {
        fn claim_due_jobs(
            &mut self,
            _server_id: &jobrun_core::ServerId,
            _limit: u32,
        ) -> Result<Vec<Run>, RunError> {
            Ok(Vec::new())
        }

        fn transition_run(
            &mut self,
            _run_id: RunId,
            _transition: crate::runs::store::RunTransition,
        ) -> Result<Vec<Run>, RunError> {
            Ok(Vec::new())
        }

        fn set_next_scheduled_run(
            &mut self,
            _plugin_id: &str,
            _job_name: &str,
            _next_run_in_secs: i64,
        ) -> Result<Vec<jobrun_core::JobRef>, RunError> {
            Ok(Vec::new())
        }

        fn interrupt_stale_runs(
            &mut self,
            _threshold_secs: i64,
            _server_id: Option<&jobrun_core::ServerId>,
        ) -> Result<Vec<Run>, RunError> {
            Ok(Vec::new())
        }

        fn lookup_run(&mut self, _run_id: RunId) -> Result<Option<Run>, RunError> {
            Ok(None)
        }

        fn delete_run(&mut self, _run_id: RunId) -> Result<u64, RunError> {
            Ok(0)
        }
    }

    impl RunStore for ScriptedStore {
        fn transact<T, F>(&self, work: F) -> Result<T, RunError>
        where
            F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>,
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            work(&mut NoopTx)
        }

        fn lookup_run(&self, _run_id: RunId) -> Result<Option<Run>, RunError> {
            Ok(None)
        }
    }

    fn deadlock() -> RunError {
        RunError::store("tx", StoreFault::deadlock("deadlock detected"))
    }

    fn quick(retries: u32) -> RetryableTransaction {
        RetryableTransaction::new(retries, ConstantBackoff(Duration::from_millis(1)))
    }

    #[test]
    fn transient_faults_are_retried_until_success() {
        let store = ScriptedStore::failing_with(vec![deadlock(), deadlock()]);
        let value = quick(3)
            .run(&store, &CancelToken::new(), "test", |_tx| Ok(42))
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(store.calls(), 3);
    }

    #[test]
    fn business_errors_abort_without_retry() {
        let store = ScriptedStore::failing_with(Vec::new());
        let run_id = RunId::new();
        let err = quick(5)
            .run(&store, &CancelToken::new(), "test", |_tx| -> Result<(), _> {
                Err(RunError::NotFound { op: "inner", run_id })
            })
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound { op: "inner", .. }));
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn non_transient_store_faults_abort_without_retry() {
        let store =
            ScriptedStore::failing_with(vec![RunError::store("tx", StoreFault::other("syntax"))]);
        let err = quick(5)
            .run(&store, &CancelToken::new(), "test", |_tx| Ok(()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Store);
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn exhausting_retries_reports_every_attempt() {
        let store = ScriptedStore::failing_with((0..10).map(|_| deadlock()).collect());
        let err = quick(2)
            .run(&store, &CancelToken::new(), "test", |_tx| Ok(()))
            .unwrap_err();

        match err {
            RunError::MaxRetries {
                op,
                attempts,
                errors,
            } => {
                assert_eq!(op, "test");
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().all(RunError::is_transient));
            }
            other => panic!("expected MaxRetries, got {other:?}"),
        }
        assert_eq!(store.calls(), 3);
    }

    #[test]
    fn cancelled_token_prevents_the_first_attempt() {
        let store = ScriptedStore::failing_with(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = quick(3)
            .run(&store, &cancel, "test", |_tx| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { attempts: 0, .. }));
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn deadline_interrupts_the_backoff_wait() {
        let store = ScriptedStore::failing_with(vec![deadlock()]);
        let retry = RetryableTransaction::new(3, ConstantBackoff(Duration::from_secs(30)));
        let cancel = CancelToken::new().with_timeout(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let err = retry.run(&store, &cancel, "test", |_tx| Ok(())).unwrap_err();
        match err {
            RunError::Cancelled { attempts, errors, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(errors.len(), 1);
                assert!(errors[0].is_transient());
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.calls(), 1);
    }
}
