//! Execution-clock parameters and their dominance order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// `execution = real * rate + offset`, effective from `change_time` (real ms).
///
/// Parameter sets are totally ordered: by `change_time`, then by the
/// execution time they yield at `change_time`, then by `offset`, then by
/// `rate`. When several agents broadcast clock changes concurrently, every
/// receiver keeps the dominant set regardless of delivery order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerParameters {
    pub rate: f64,
    pub offset: i64,
    pub change_time: i64,
}

impl TimerParameters {
    pub fn new(rate: f64, offset: i64, change_time: i64) -> Self {
        Self {
            rate,
            offset,
            change_time,
        }
    }

    /// Execution time equal to real time, effective forever.
    pub fn identity() -> Self {
        Self::new(1.0, 0, i64::MIN)
    }

    /// Parameters that make execution time equal `execution` at real time
    /// `real`, advancing at `rate` from then on.
    pub fn anchored(execution: i64, real: i64, rate: f64) -> Self {
        let offset = execution - scale(real, rate);
        Self::new(rate, offset, real)
    }

    /// Execution time at real time `real`.
    pub fn compute(&self, real: i64) -> i64 {
        scale(real, self.rate).saturating_add(self.offset)
    }

    /// Real time at which execution time reaches `execution`, if it ever does.
    pub fn real_time_for(&self, execution: i64) -> Option<i64> {
        if self.rate <= 0.0 {
            return None;
        }
        Some(((execution - self.offset) as f64 / self.rate).ceil() as i64)
    }

    /// Usable rates are finite and non-negative. Zero pauses the clock.
    pub fn is_valid(&self) -> bool {
        self.rate.is_finite() && self.rate >= 0.0
    }
}

fn scale(real: i64, rate: f64) -> i64 {
    if rate == 1.0 {
        real
    } else {
        (real as f64 * rate) as i64
    }
}

impl Ord for TimerParameters {
    fn cmp(&self, other: &Self) -> Ordering {
        self.change_time
            .cmp(&other.change_time)
            .then_with(|| {
                self.compute(self.change_time)
                    .cmp(&other.compute(other.change_time))
            })
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.rate.total_cmp(&other.rate))
    }
}

impl PartialOrd for TimerParameters {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerParameters {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerParameters {}

/// How the execution time jumps in a [`TimeChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeJump {
    /// Keep the execution time continuous.
    #[default]
    None,
    /// Move forward (or back) by this many milliseconds.
    Relative(i64),
    /// Set execution time to this value.
    Absolute(i64),
}

/// A requested clock change, turned into [`TimerParameters`] by
/// [`ExecutionTimer::change_time`](super::ExecutionTimer::change_time).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeChange {
    pub jump: TimeJump,
    /// New rate; `None` keeps the current one, `Some(0.0)` pauses.
    pub rate: Option<f64>,
    /// Real milliseconds from now until the change takes effect.
    pub change_delay: i64,
}

impl TimeChange {
    pub fn advance(millis: i64) -> Self {
        Self {
            jump: TimeJump::Relative(millis),
            ..Self::default()
        }
    }

    pub fn set_rate(rate: f64) -> Self {
        Self {
            rate: Some(rate),
            ..Self::default()
        }
    }

    pub fn pause() -> Self {
        Self::set_rate(0.0)
    }

    pub fn with_delay(mut self, change_delay: i64) -> Self {
        self.change_delay = change_delay;
        self
    }
}
