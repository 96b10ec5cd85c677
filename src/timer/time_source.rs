//! Real-time sources.
//!
//! Every time-dependent component (checkpoint policy, message manager,
//! timers) reads real time through a [`TimeSource`] so tests can drive the
//! clock by hand.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of real (wall-clock) milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_source_moves_on_demand() {
        let src = ManualTimeSource::new(1_000);
        assert_eq!(src.now_millis(), 1_000);
        src.advance(250);
        assert_eq!(src.now_millis(), 1_250);
        src.set(10);
        assert_eq!(src.now_millis(), 10);
    }

    #[test]
    fn test_system_source_is_after_2020() {
        assert!(SystemTimeSource.now_millis() > 1_577_836_800_000);
    }
}
