//! Scheduler process: configuration and wiring of the run lifecycle core.

pub mod app;
pub mod config;

pub use app::{App, SchedulerStore};
pub use config::{ConfigError, SchedulerConfig};
