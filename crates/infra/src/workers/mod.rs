//! Background worker loops over the run repository.

pub mod executor;
pub mod reaper;

use std::thread;

use tracing::error;

use crate::retry::CancelToken;

pub use executor::{
    ExecutorConfig, ExecutorStats, HandlerRegistry, RunContext, RunExecutor, RunHandler,
    RunOutcome,
};
pub use reaper::{Reaper, ReaperConfig};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    cancel: CancelToken,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, cancel: CancelToken, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            cancel,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Cancel the worker (interrupting any wait or retry backoff) and wait
    /// for it to stop.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}
