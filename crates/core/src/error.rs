//! Run lifecycle error model.

use thiserror::Error;

use crate::id::RunId;
use crate::run::RunStatus;

/// Result type used across the run lifecycle.
pub type RunResult<T> = Result<T, RunError>;

/// Flat classification of every failure the lifecycle can surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameter,
    NotFound,
    InvalidJobRunState,
    MultipleRecords,
    MaxRetries,
    SendFailed,
    Cancelled,
    Store,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "invalid_parameter",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidJobRunState => "invalid_job_run_state",
            ErrorCode::MultipleRecords => "multiple_records",
            ErrorCode::MaxRetries => "max_retries",
            ErrorCode::SendFailed => "send_failed",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Store => "store",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of a backing-store failure.
///
/// Only `SerializationConflict`, `Deadlock` and `ConnectionLost` are
/// retryable. Anything a store cannot classify is `Other`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FaultClass {
    SerializationConflict,
    Deadlock,
    ConnectionLost,
    Other,
}

impl FaultClass {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FaultClass::SerializationConflict | FaultClass::Deadlock | FaultClass::ConnectionLost
        )
    }
}

impl core::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FaultClass::SerializationConflict => "serialization conflict",
            FaultClass::Deadlock => "deadlock victim",
            FaultClass::ConnectionLost => "connection lost",
            FaultClass::Other => "store error",
        };
        f.write_str(s)
    }
}

/// A failure reported by the backing store, independent of the driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct StoreFault {
    pub class: FaultClass,
    pub message: String,
}

impl StoreFault {
    pub fn new(class: FaultClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn serialization_conflict(message: impl Into<String>) -> Self {
        Self::new(FaultClass::SerializationConflict, message)
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Deadlock, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(FaultClass::ConnectionLost, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Other, message)
    }
}

/// Run lifecycle error.
///
/// Every variant names the operation (`op`) it was raised from.
/// `InvalidParameter`, `NotFound` and `InvalidJobRunState` are business
/// outcomes and are never retried. `MultipleRecords` means a primary-key
/// predicate matched more than one row: a schema or predicate bug, not a
/// runtime condition.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{op}: {msg}: parameter violation")]
    InvalidParameter { op: &'static str, msg: String },

    #[error("{op}: job run {run_id} does not exist")]
    NotFound { op: &'static str, run_id: RunId },

    #[error("{op}: job run {run_id} was in a final run state: {status}")]
    InvalidJobRunState {
        op: &'static str,
        run_id: RunId,
        status: RunStatus,
    },

    #[error("{op}: {msg}: multiple records")]
    MultipleRecords { op: &'static str, msg: String },

    #[error("{op}: too many retries: {attempts} attempts failed: {}", join_errors(errors))]
    MaxRetries {
        op: &'static str,
        attempts: u32,
        errors: Vec<RunError>,
    },

    #[error("{op}: cancelled after {attempts} attempt(s){}", cancelled_suffix(errors))]
    Cancelled {
        op: &'static str,
        attempts: u32,
        /// Transient failures seen before cancellation, oldest first
        errors: Vec<RunError>,
    },

    #[error("{op}: {fault}")]
    Store {
        op: &'static str,
        #[source]
        fault: StoreFault,
    },
}

impl RunError {
    pub fn invalid_parameter(op: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            op,
            msg: msg.into(),
        }
    }

    pub fn multiple_records(op: &'static str, msg: impl Into<String>) -> Self {
        Self::MultipleRecords {
            op,
            msg: msg.into(),
        }
    }

    pub fn store(op: &'static str, fault: StoreFault) -> Self {
        Self::Store { op, fault }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RunError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            RunError::NotFound { .. } => ErrorCode::NotFound,
            RunError::InvalidJobRunState { .. } => ErrorCode::InvalidJobRunState,
            RunError::MultipleRecords { .. } => ErrorCode::MultipleRecords,
            RunError::MaxRetries { .. } => ErrorCode::MaxRetries,
            RunError::Cancelled { .. } => ErrorCode::Cancelled,
            RunError::Store { .. } => ErrorCode::Store,
        }
    }

    /// True only for store faults in the retryable set.
    pub fn is_transient(&self) -> bool {
        match self {
            RunError::Store { fault, .. } => fault.class.is_transient(),
            _ => false,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            RunError::InvalidParameter { op, .. }
            | RunError::NotFound { op, .. }
            | RunError::InvalidJobRunState { op, .. }
            | RunError::MultipleRecords { op, .. }
            | RunError::MaxRetries { op, .. }
            | RunError::Cancelled { op, .. }
            | RunError::Store { op, .. } => op,
        }
    }
}

fn cancelled_suffix(errors: &[RunError]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(": {}", join_errors(errors))
    }
}

fn join_errors(errors: &[RunError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(idx, e)| format!("attempt {}: {e}", idx + 1))
        .collect::<Vec<_>>()
        .join("; ")
}
