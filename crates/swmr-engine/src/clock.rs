//! Monotonic time for tick deadlines.
//!
//! Timestamps are `Duration`s since an arbitrary per-clock origin, which
//! keeps deadline arithmetic plain and lets tests substitute a manually
//! advanced clock.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Time source for end-of-tick deadlines and the close-time drain loop.
pub trait TickClock: Send + Sync {
    /// Monotonic timestamp since the clock's origin.
    fn now(&self) -> Duration;

    /// Block for `duration`. Only the writer's flush-or-close drain calls
    /// this; readers never suspend inside the engine.
    fn sleep(&self, duration: Duration);
}

/// Wall implementation over [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock for deterministic tests. `sleep` advances the
/// clock instead of blocking, so drain loops make progress instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl TickClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_sleep_advances_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.sleep(Duration::from_millis(100));
        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), Duration::from_millis(150));
    }
}
