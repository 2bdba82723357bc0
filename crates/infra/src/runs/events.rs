//! Run lifecycle events.
//!
//! Events are published only after the transaction that produced them has
//! committed. Delivery goes through [`RetryableSend`]; a delivery failure is
//! logged and never undoes the committed state change.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use jobrun_core::Run;

use crate::retry::{CancelToken, RetryableSend, SendAttempt};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Claimed,
    Completed,
    Failed,
    Interrupted,
}

impl RunEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventKind::Claimed => "claimed",
            RunEventKind::Completed => "completed",
            RunEventKind::Failed => "failed",
            RunEventKind::Interrupted => "interrupted",
        }
    }
}

/// A committed run state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    pub event_id: Uuid,
    pub kind: RunEventKind,
    pub run: Run,
    pub occurred_at: DateTime<Utc>,
}

impl RunEvent {
    /// Event for `run`, timestamped with the run's own update time.
    pub fn new(kind: RunEventKind, run: Run) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            occurred_at: run.update_time,
            run,
        }
    }
}

/// Destination for run events.
///
/// One call is one delivery attempt; retry is the publisher's job.
pub trait RunEventSink: Send + Sync {
    fn deliver(&self, event: &RunEvent) -> SendAttempt;
}

/// Sink that writes each event to the log as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunEventSink;

impl RunEventSink for TracingRunEventSink {
    fn deliver(&self, event: &RunEvent) -> SendAttempt {
        match serde_json::to_string(event) {
            Ok(payload) => {
                info!(
                    kind = event.kind.as_str(),
                    run_id = %event.run.private_id,
                    event = %payload,
                    "run event"
                );
                SendAttempt::delivered()
            }
            Err(e) => SendAttempt::rejected(format!("serialize run event: {e}")),
        }
    }
}

/// In-memory sink for tests. Scripted attempt outcomes are consumed first;
/// once exhausted every attempt is delivered.
#[derive(Debug, Default)]
pub struct InMemoryRunEventSink {
    delivered: Mutex<Vec<RunEvent>>,
    script: Mutex<Vec<SendAttempt>>,
}

impl InMemoryRunEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next delivery attempt.
    pub fn push_outcome(&self, attempt: SendAttempt) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(attempt);
    }

    pub fn delivered(&self) -> Vec<RunEvent> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<RunEventKind> {
        self.delivered().iter().map(|e| e.kind).collect()
    }
}

impl RunEventSink for InMemoryRunEventSink {
    fn deliver(&self, event: &RunEvent) -> SendAttempt {
        let scripted = {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        let attempt = scripted.unwrap_or_else(SendAttempt::delivered);
        if attempt.failure.is_none() {
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }
        attempt
    }
}

/// Publishes committed run events to a sink with bounded retry.
#[derive(Clone)]
pub struct RunEventPublisher {
    sink: Arc<dyn RunEventSink>,
    send: RetryableSend,
    cancel: CancelToken,
}

impl std::fmt::Debug for RunEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventPublisher")
            .field("send", &self.send)
            .finish_non_exhaustive()
    }
}

impl RunEventPublisher {
    pub fn new(sink: Arc<dyn RunEventSink>) -> Self {
        Self {
            sink,
            send: RetryableSend::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_send(mut self, send: RetryableSend) -> Self {
        self.send = send;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deliver every event. Returns how many were delivered.
    pub fn publish(&self, kind: RunEventKind, runs: &[Run]) -> usize {
        let mut delivered = 0;
        for run in runs {
            let event = RunEvent::new(kind, run.clone());
            match self
                .send
                .send(&self.cancel, "run_event_publisher.publish", || {
                    self.sink.deliver(&event)
                }) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    error!(
                        kind = kind.as_str(),
                        run_id = %run.private_id,
                        code = %e.code(),
                        error = %e,
                        "failed to publish run event"
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobrun_core::{JobRef, RunId, ServerId};

    use crate::retry::ConstantBackoff;

    fn sample_run() -> Run {
        let now = Utc::now();
        Run::claimed(
            RunId::new(),
            &JobRef::new("pi_test", "sync", now),
            ServerId::from("srv-1"),
            now,
        )
    }

    fn publisher(sink: Arc<InMemoryRunEventSink>) -> RunEventPublisher {
        RunEventPublisher::new(sink)
            .with_send(RetryableSend::new(2, ConstantBackoff(Duration::from_millis(1))))
    }

    #[test]
    fn event_serializes_kind_and_run() {
        let event = RunEvent::new(RunEventKind::Claimed, sample_run());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "claimed");
        assert_eq!(json["run"]["status"], "running");
        assert_eq!(json["run"]["server_id"], "srv-1");
    }

    #[test]
    fn publish_retries_transient_sink_failures() {
        let sink = Arc::new(InMemoryRunEventSink::new());
        sink.push_outcome(SendAttempt::retryable("collector busy"));

        let delivered = publisher(sink.clone()).publish(RunEventKind::Failed, &[sample_run()]);

        assert_eq!(delivered, 1);
        assert_eq!(sink.kinds(), [RunEventKind::Failed]);
    }

    #[test]
    fn exhausted_delivery_is_dropped_not_raised() {
        let sink = Arc::new(InMemoryRunEventSink::new());
        for _ in 0..3 {
            sink.push_outcome(SendAttempt::retryable("collector down"));
        }

        let delivered = publisher(sink.clone()).publish(RunEventKind::Completed, &[sample_run()]);

        assert_eq!(delivered, 0);
        assert!(sink.delivered().is_empty());
    }

    #[test]
    fn tracing_sink_always_confirms() {
        let event = RunEvent::new(RunEventKind::Interrupted, sample_run());
        let attempt = TracingRunEventSink.deliver(&event);
        assert!(attempt.failure.is_none());
    }
}
