//! Time sources for rate-limit decisions.
//!
//! Algorithms work on wall-clock seconds since the Unix epoch as `f64`, so
//! fixed windows align to epoch boundaries. [`ManualClock`] lets tests and
//! simulations drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock.
///
/// Stores the current time as `f64` bits in an `AtomicU64`, so it can be
/// shared between tasks without locking.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds since the epoch.
    pub fn new(start: f64) -> Self {
        Self {
            secs: AtomicU64::new(start.to_bits()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.set(self.now() + by.as_secs_f64());
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: f64) {
        self.secs.store(secs.to_bits(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.secs.load(Ordering::SeqCst))
    }
}
