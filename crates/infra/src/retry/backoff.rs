//! Wait strategies between retry attempts.

use std::time::Duration;

use rand::Rng;

/// Default unit for [`ExpBackoff`].
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_millis(5);

// 2^32 units is already far beyond any sane wait.
const MAX_EXPONENT: u32 = 32;

/// Computes how long to wait before retrying after a failed attempt.
pub trait Backoff: Send + Sync {
    /// Wait after the 1-indexed `attempt`.
    fn duration(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with multiplicative jitter.
///
/// `duration(n) = unit * 2^n * (0.5 + U[0, 1))`, so every wait falls in
/// `[unit * 2^n * 0.5, unit * 2^n * 1.5)`. The jitter keeps concurrently
/// retrying callers from waking in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpBackoff {
    unit: Duration,
}

impl ExpBackoff {
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Lower and upper (exclusive) bounds of `duration(attempt)`.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let scaled = self.scaled_nanos(attempt);
        (
            Duration::from_nanos((scaled * 0.5) as u64),
            Duration::from_nanos((scaled * 1.5) as u64),
        )
    }

    fn scaled_nanos(&self, attempt: u32) -> f64 {
        self.unit.as_nanos() as f64 * 2_f64.powi(attempt.min(MAX_EXPONENT) as i32)
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_UNIT)
    }
}

impl Backoff for ExpBackoff {
    fn duration(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_nanos((self.scaled_nanos(attempt) * (0.5 + jitter)) as u64)
    }
}

/// Same wait every time; mostly useful in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn duration(&self, _attempt: u32) -> Duration {
        self.0
    }
}
