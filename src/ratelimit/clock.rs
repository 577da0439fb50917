//! Time sources for the limiter.

use chrono::Utc;
use parking_lot::Mutex;

/// A source of wall-clock time in fractional epoch seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Reads the system clock with microsecond resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and by the CLI's `check --spacing` mode to step time
/// deterministically across window boundaries.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` epoch seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    /// Jump the clock to an absolute time, backwards included.
    pub fn set(&self, at: f64) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
