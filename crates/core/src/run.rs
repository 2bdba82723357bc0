//! Job runs and the job definitions they execute.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::id::{RunId, ServerId};

/// Run status.
///
/// The only legal transitions are `Running -> {Completed, Failed, Interrupted}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Claimed by a server and executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error reported by the worker
    Failed,
    /// Reclaimed after the worker stopped reporting progress
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(RunError::invalid_parameter(
                "RunStatus::from_str",
                format!("unknown run status {other:?}"),
            )),
        }
    }
}

/// One execution attempt of a job definition.
///
/// `server_id` is fixed at claim time. `end_time` is `None` exactly while
/// the run is `Running`. Once terminal, a run only changes by deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub private_id: RunId,
    pub job_plugin_id: String,
    pub job_name: String,
    pub server_id: ServerId,
    pub completed_count: u32,
    pub total_count: u32,
    pub status: RunStatus,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Run {
    /// A freshly claimed run, stamped with the store clock.
    pub fn claimed(
        private_id: RunId,
        job: &JobRef,
        server_id: ServerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            private_id,
            job_plugin_id: job.plugin_id.clone(),
            job_name: job.name.clone(),
            server_id,
            completed_count: 0,
            total_count: 0,
            status: RunStatus::Running,
            create_time: now,
            update_time: now,
            end_time: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// True if this run executes the given job definition.
    pub fn executes(&self, job: &JobRef) -> bool {
        self.job_plugin_id == job.plugin_id && self.job_name == job.name
    }
}

/// The job definition a run executes.
///
/// Owned by the job-definition store; the run lifecycle only reads it and,
/// on successful completion, advances `next_scheduled_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub plugin_id: String,
    pub name: String,
    pub next_scheduled_run: DateTime<Utc>,
}

impl JobRef {
    pub fn new(
        plugin_id: impl Into<String>,
        name: impl Into<String>,
        next_scheduled_run: DateTime<Utc>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            name: name.into(),
            next_scheduled_run,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_scheduled_run <= now
    }
}
