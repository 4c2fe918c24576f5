//! Time sources.
//!
//! Everything time-dependent (undo coalescing, awareness throttling,
//! reconciler debounce, idle detection) takes a [`Clock`] so tests can drive
//! time by hand.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use web_time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time, used for throttling and debouncing.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the unix epoch, used for values that
    /// cross the wire (such as presence activity stamps).
    fn unix_millis(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    base_millis: u64,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(1_700_000_000_000)
    }

    /// Start the wall clock at the given unix millisecond stamp.
    pub fn starting_at(unix_millis: u64) -> Self {
        Self {
            base: Instant::now(),
            base_millis: unix_millis,
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    pub fn advance_millis(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn unix_millis(&self) -> u64 {
        self.base_millis + self.offset().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_both_sources() {
        let clock = ManualClock::starting_at(1_000);
        let start = clock.now();

        clock.advance_millis(250);

        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.unix_millis(), 1_250);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let before = other.unix_millis();

        clock.advance_millis(10);

        assert_eq!(other.unix_millis(), before + 10);
    }
}
