//! Deliver-and-confirm with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use jobrun_core::ErrorCode;

use super::backoff::{Backoff, ExpBackoff};
use super::cancel::CancelToken;

/// Standard number of retries after the first delivery attempt.
pub const STD_SEND_RETRIES: u32 = 3;

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// No confirmation; worth trying again after a wait.
    Retryable(String),
    /// The sink refused the payload; retrying cannot help.
    Rejected(String),
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendFailure::Retryable(msg) => write!(f, "{msg}"),
            SendFailure::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

/// Outcome of one delivery attempt: non-fatal warnings plus an optional
/// hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendAttempt {
    pub warnings: Vec<String>,
    pub failure: Option<SendFailure>,
}

impl SendAttempt {
    pub fn delivered() -> Self {
        Self::default()
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self {
            warnings: Vec::new(),
            failure: Some(SendFailure::Retryable(msg.into())),
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self {
            warnings: Vec::new(),
            failure: Some(SendFailure::Rejected(msg.into())),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Retry statistics of a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryInfo {
    pub retries: u32,
    pub backoff: Duration,
}

/// Delivery error.
///
/// `MaxRetries` means the sink never confirmed within the attempt ceiling;
/// `Failed` means the sink rejected the payload. Both keep every attempt's
/// failure, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("{op}: too many retries: {attempts} of {ceiling}: {}", errors.join("; "))]
    MaxRetries {
        op: &'static str,
        attempts: u32,
        ceiling: u32,
        errors: Vec<String>,
    },

    #[error("{op}: failed to send on attempt {attempt}: {reason}")]
    Failed {
        op: &'static str,
        attempt: u32,
        reason: String,
        errors: Vec<String>,
    },

    #[error("{op}: cancelled after {attempts} attempt(s)")]
    Cancelled {
        op: &'static str,
        attempts: u32,
        errors: Vec<String>,
    },
}

impl SendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SendError::MaxRetries { .. } => ErrorCode::MaxRetries,
            SendError::Failed { .. } => ErrorCode::SendFailed,
            SendError::Cancelled { .. } => ErrorCode::Cancelled,
        }
    }

    /// Every per-attempt failure, oldest first.
    pub fn attempt_errors(&self) -> &[String] {
        match self {
            SendError::MaxRetries { errors, .. }
            | SendError::Failed { errors, .. }
            | SendError::Cancelled { errors, .. } => errors,
        }
    }
}

/// Applies backoff to a deliver-and-confirm operation.
///
/// Each attempt's warnings are logged and never retried. A retryable failure
/// waits and tries again, up to `retries + 1` attempts in total.
#[derive(Clone)]
pub struct RetryableSend {
    retries: u32,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for RetryableSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryableSend")
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl Default for RetryableSend {
    fn default() -> Self {
        Self::new(STD_SEND_RETRIES, ExpBackoff::default())
    }
}

impl RetryableSend {
    pub fn new(retries: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            retries,
            backoff: Arc::new(backoff),
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn send<F>(
        &self,
        cancel: &CancelToken,
        op: &'static str,
        mut handler: F,
    ) -> Result<RetryInfo, SendError>
    where
        F: FnMut() -> SendAttempt,
    {
        let ceiling = self.retries.saturating_add(1);
        let mut errors = Vec::new();
        let mut info = RetryInfo::default();

        for attempt in 1..=ceiling {
            if cancel.is_cancelled() {
                return Err(SendError::Cancelled {
                    op,
                    attempts: attempt - 1,
                    errors,
                });
            }

            let outcome = handler();
            if !outcome.warnings.is_empty() {
                warn!(op, attempt, warnings = ?outcome.warnings, "send completed with warnings");
            }

            match outcome.failure {
                None => return Ok(info),
                Some(SendFailure::Rejected(reason)) => {
                    errors.push(format!("attempt {attempt}: rejected: {reason}"));
                    error!(op, attempt, reason = %reason, "send rejected");
                    return Err(SendError::Failed {
                        op,
                        attempt,
                        reason,
                        errors,
                    });
                }
                Some(SendFailure::Retryable(msg)) => {
                    errors.push(format!("attempt {attempt}: {msg}"));
                    if attempt == ceiling {
                        break;
                    }
                    let wait = self.backoff.duration(attempt);
                    warn!(
                        op,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        error = %msg,
                        "send failed; retrying"
                    );
                    info.retries += 1;
                    info.backoff += wait;
                    if !cancel.sleep(wait) {
                        return Err(SendError::Cancelled {
                            op,
                            attempts: attempt,
                            errors,
                        });
                    }
                }
            }
        }

        Err(SendError::MaxRetries {
            op,
            attempts: ceiling,
            ceiling,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::backoff::ConstantBackoff;

    fn quick(retries: u32) -> RetryableSend {
        RetryableSend::new(retries, ConstantBackoff(Duration::from_millis(1)))
    }

    #[test]
    fn gives_up_after_ceiling_plus_one_attempts() {
        let mut calls = 0;
        let err = quick(3)
            .send(&CancelToken::new(), "send", || {
                calls += 1;
                SendAttempt::retryable(format!("timeout {calls}"))
            })
            .unwrap_err();

        assert_eq!(calls, 4);
        assert_eq!(err.code(), ErrorCode::MaxRetries);
        assert_eq!(err.attempt_errors().len(), 4);
        assert_eq!(err.attempt_errors()[0], "attempt 1: timeout 1");
        assert_eq!(err.attempt_errors()[3], "attempt 4: timeout 4");
        assert!(err.to_string().contains("too many retries: 4 of 4"));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let info = quick(3)
            .send(&CancelToken::new(), "send", || {
                calls += 1;
                if calls < 3 {
                    SendAttempt::retryable("no ack")
                } else {
                    SendAttempt::delivered()
                }
            })
            .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(info.retries, 2);
        assert_eq!(info.backoff, Duration::from_millis(2));
    }

    #[test]
    fn warnings_alone_do_not_trigger_a_retry() {
        let mut calls = 0;
        let info = quick(3)
            .send(&CancelToken::new(), "send", || {
                calls += 1;
                SendAttempt::delivered().with_warning("slow collector")
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(info, RetryInfo::default());
    }

    #[test]
    fn rejection_is_reported_as_send_failed_without_retry() {
        let mut calls = 0;
        let err = quick(3)
            .send(&CancelToken::new(), "send", || {
                calls += 1;
                if calls == 1 {
                    SendAttempt::retryable("no ack")
                } else {
                    SendAttempt::rejected("schema mismatch")
                }
            })
            .unwrap_err();

        assert_eq!(calls, 2);
        assert_eq!(err.code(), ErrorCode::SendFailed);
        assert_eq!(err.attempt_errors().len(), 2);
        assert!(matches!(err, SendError::Failed { attempt: 2, .. }));
    }

    #[test]
    fn cancellation_stops_remaining_attempts() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let err = quick(5)
            .send(&cancel, "send", || {
                calls += 1;
                cancel.cancel();
                SendAttempt::retryable("no ack")
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(err.attempt_errors().len(), 1);
    }
}
