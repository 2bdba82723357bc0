//! Job run lifecycle.
//!
//! `RunRepository` drives runs through `running -> {completed, failed,
//! interrupted}` against a transactional `RunStore`. Two stores are provided:
//! `InMemoryRunStore` for tests/dev and `PostgresRunStore` for deployments.

pub mod clock;
pub mod events;
pub mod in_memory;
pub mod postgres;
pub mod repository;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{
    InMemoryRunEventSink, RunEvent, RunEventKind, RunEventPublisher, RunEventSink,
    TracingRunEventSink,
};
pub use in_memory::{InMemoryRunStore, StoreOp};
pub use postgres::PostgresRunStore;
pub use repository::{DEFAULT_RUN_JOBS_LIMIT, RunRepository};
pub use store::{RunStore, RunTransition, RunTx};
