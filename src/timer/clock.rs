//! Logical clocks driven by a [`Timer`](super::Timer).
//!
//! A clock maps real time to its own notion of time and tells the timer
//! thread how long to sleep in real time for a given logical delta. Both
//! clocks here are ratcheted: a returned time never precedes one returned
//! before it.

use super::parameters::TimerParameters;

/// Default bound on queued parameter sets (current included).
pub const DEFAULT_PARAMETER_CAPACITY: usize = 5;

/// Time base of a [`Timer`](super::Timer).
pub trait LogicalClock: Send + 'static {
    /// Logical time at real time `real_now`; never smaller than the previous
    /// return value.
    fn current_time_millis(&mut self, real_now: i64) -> i64;

    /// Real milliseconds until `delta` logical milliseconds have elapsed, or
    /// `None` if the clock is stopped.
    fn real_delay_for(&self, delta: i64) -> Option<i64>;

    /// Real time of the next scheduled rate/offset change, if any.
    fn next_change_time(&self) -> Option<i64>;
}

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

/// Real time, ratcheted against backwards jumps of the system clock.
#[derive(Debug, Default)]
pub struct WallClock {
    last_returned: i64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogicalClock for WallClock {
    fn current_time_millis(&mut self, real_now: i64) -> i64 {
        self.last_returned = self.last_returned.max(real_now);
        self.last_returned
    }

    fn real_delay_for(&self, delta: i64) -> Option<i64> {
        Some(delta)
    }

    fn next_change_time(&self) -> Option<i64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Execution clock
// ---------------------------------------------------------------------------

/// Society execution time: real time scaled and shifted by the current
/// [`TimerParameters`].
///
/// `params[0]` is the set in effect; the rest are pending, sorted by the
/// dominance order, and are promoted once real time reaches their
/// `change_time`.
#[derive(Debug)]
pub struct ExecutionClock {
    params: Vec<TimerParameters>,
    capacity: usize,
    last_returned: i64,
}

impl Default for ExecutionClock {
    fn default() -> Self {
        Self::new(TimerParameters::identity(), DEFAULT_PARAMETER_CAPACITY)
    }
}

impl ExecutionClock {
    pub fn new(initial: TimerParameters, capacity: usize) -> Self {
        Self {
            params: vec![initial],
            capacity: capacity.max(2),
            last_returned: i64::MIN,
        }
    }

    /// Promote every pending set whose change time has passed.
    pub fn promote(&mut self, real_now: i64) {
        while self.params.len() > 1 && self.params[1].change_time <= real_now {
            let retired = self.params.remove(0);
            log::debug!(
                "ExecutionClock: parameters {:?} replaced by {:?}",
                retired,
                self.params[0]
            );
        }
    }

    /// Parameters in effect at real time `real_now`.
    pub fn current_parameters(&mut self, real_now: i64) -> TimerParameters {
        self.promote(real_now);
        self.params[0]
    }

    /// Parameters that will be in effect at real time `real` given what is
    /// queued now.
    pub fn parameters_at(&self, real: i64) -> TimerParameters {
        self.params
            .iter()
            .take_while(|p| p.change_time <= real)
            .last()
            .copied()
            .unwrap_or(self.params[0])
    }

    /// Pending (not yet effective) sets.
    pub fn pending(&self) -> &[TimerParameters] {
        &self.params[1..]
    }

    /// Queue a parameter set.
    ///
    /// Sets that do not dominate the current one, duplicates, and invalid
    /// rates are rejected. When the queue is full the new set evicts the
    /// oldest pending entry; the current set is never evicted.
    pub fn add_parameters(&mut self, params: TimerParameters, real_now: i64) -> bool {
        if !params.is_valid() {
            log::warn!("ExecutionClock: rejecting invalid rate {}", params.rate);
            return false;
        }
        self.promote(real_now);
        if params <= self.params[0] || self.params.contains(&params) {
            log::debug!("ExecutionClock: ignoring dominated parameters {:?}", params);
            return false;
        }
        if self.params.len() >= self.capacity {
            let evicted = self.params.remove(1);
            log::warn!(
                "ExecutionClock: parameter queue full, dropping pending {:?}",
                evicted
            );
        }
        let at = self.params[1..].partition_point(|p| *p < params) + 1;
        self.params.insert(at, params);
        true
    }
}

impl LogicalClock for ExecutionClock {
    fn current_time_millis(&mut self, real_now: i64) -> i64 {
        self.promote(real_now);
        let value = self.params[0].compute(real_now);
        self.last_returned = self.last_returned.max(value);
        self.last_returned
    }

    fn real_delay_for(&self, delta: i64) -> Option<i64> {
        let rate = self.params[0].rate;
        if rate <= 0.0 {
            return None;
        }
        Some((delta as f64 / rate).ceil() as i64)
    }

    fn next_change_time(&self) -> Option<i64> {
        self.params.get(1).map(|p| p.change_time)
    }
}
