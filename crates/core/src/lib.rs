//! `jobrun-core` — run lifecycle building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Run` and `JobRef` entities, and the error taxonomy shared
//! by every store and worker.

pub mod error;
pub mod id;
pub mod run;

pub use error::{ErrorCode, FaultClass, RunError, RunResult, StoreFault};
pub use id::{RunId, ServerId};
pub use run::{JobRef, Run, RunStatus};
