//! Infrastructure layer: run stores, retry primitives, worker loops.

pub mod retry;
pub mod runs;
pub mod workers;
