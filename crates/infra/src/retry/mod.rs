//! Retry primitives shared by store transactions and event delivery.
//!
//! ## Components
//!
//! - `Backoff` / `ExpBackoff`: jittered exponential wait per attempt
//! - `CancelToken`: cancellation + deadline observed before each attempt and
//!   during each wait
//! - `RetryableTransaction`: unit of work in a store transaction, retried on
//!   transient store faults only
//! - `RetryableSend`: deliver-and-confirm, retried on unconfirmed delivery

pub mod backoff;
pub mod cancel;
pub mod send;
pub mod transaction;

pub use backoff::{Backoff, ConstantBackoff, DEFAULT_BACKOFF_UNIT, ExpBackoff};
pub use cancel::CancelToken;
pub use send::{
    RetryInfo, RetryableSend, STD_SEND_RETRIES, SendAttempt, SendError, SendFailure,
};
pub use transaction::{RetryableTransaction, STD_TX_RETRIES};
