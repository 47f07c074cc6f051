//! Monotonic-millisecond time source, injectable for tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of monotonic milliseconds since an arbitrary epoch.
///
/// The engine never calls `SystemTime::now()` directly; everything goes
/// through a `Clock` so tests can advance time deterministically instead of
/// sleeping.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Real wall-clock time, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }
}

/// A manually-advanced clock for deterministic tests of TTL, GC pacing, and
/// version-timestamp ordering.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        ManualClock { millis: AtomicU64::new(start_millis) }
    }

    /// Advances the clock by `delta_millis` and returns the new time.
    pub fn advance(&self, delta_millis: u64) -> u64 {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst) + delta_millis
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let c = ManualClock::new(1000);
        assert_eq!(c.now_millis(), 1000);
        assert_eq!(c.advance(500), 1500);
        assert_eq!(c.now_millis(), 1500);
        c.set(0);
        assert_eq!(c.now_millis(), 0);
    }
}
