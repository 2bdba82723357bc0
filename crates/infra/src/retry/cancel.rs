//! Cooperative cancellation for blocking retry loops and worker threads.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cancellation signal with an optional deadline.
///
/// Clones share the same signal: cancelling one cancels all. A deadline
/// attached with [`CancelToken::with_deadline`] only applies to the returned
/// token and its clones.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token sharing this signal that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            state: self.state.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Signal cancellation and wake every thread sleeping on this token.
    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.state.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the token was
    /// cancelled or its deadline fell inside the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let now = Instant::now();
        let wake_at = now + duration;
        let (until, cut_short) = match self.deadline {
            Some(deadline) if deadline < wake_at => (deadline, true),
            _ => (wake_at, false),
        };

        let guard = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .state
            .wake
            .wait_timeout_while(guard, until.saturating_duration_since(now), |cancelled| {
                !*cancelled
            })
            .unwrap_or_else(PoisonError::into_inner);

        !*guard && !cut_short
    }
}
