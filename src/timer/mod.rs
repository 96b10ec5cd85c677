//! Timers: alarm scheduling over a logical clock.
//!
//! A [`Timer`] owns a [`LogicalClock`] and a min-heap of alarms keyed by
//! absolute expiration in that clock's time base. A background thread
//! sleeps until the next alarm is due, scaling the wait by the current rate
//! (a slow or paused execution clock sleeps longer in real time) and waking
//! early for scheduled parameter changes or newly added alarms.
//!
//! Due alarms are rung outside the timer lock, so an alarm may add or
//! cancel alarms on the same timer.
//!
//! Two timers exist per agent:
//!
//! - [`RealTimeTimer`]: wall-clock time, drives checkpoints and messaging.
//! - [`ExecutionTimer`]: society execution time, adjustable with
//!   [`TimerParameters`] or [`TimeChange`]s.

pub mod alarm;
pub mod clock;
pub mod parameters;
pub mod time_source;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub use alarm::{Alarm, CallbackAlarm, PeriodicAlarm};
pub use clock::{ExecutionClock, LogicalClock, WallClock, DEFAULT_PARAMETER_CAPACITY};
pub use parameters::{TimeChange, TimeJump, TimerParameters};
pub use time_source::{ManualTimeSource, SystemTimeSource, TimeSource};

/// Longest real-time sleep of the timer thread between re-checks.
const MAX_WAIT_MS: i64 = 10_000;

/// Timer over real time.
pub type RealTimeTimer = Timer<WallClock>;
/// Timer over society execution time.
pub type ExecutionTimer = Timer<ExecutionClock>;

// ---------------------------------------------------------------------------
// Heap entries
// ---------------------------------------------------------------------------

struct Scheduled {
    expiration: i64,
    seq: u64,
    alarm: Arc<dyn Alarm>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.expiration, self.seq).cmp(&(other.expiration, other.seq))
    }
}

struct TimerState<C> {
    clock: C,
    alarms: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

impl<C: LogicalClock> TimerState<C> {
    fn push(&mut self, expiration: i64, alarm: Arc<dyn Alarm>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.alarms.push(Reverse(Scheduled {
            expiration,
            seq,
            alarm,
        }));
    }

    /// Drop cancelled alarms sitting at the top of the heap.
    fn prune(&mut self) {
        while let Some(Reverse(top)) = self.alarms.peek() {
            if !top.alarm.is_cancelled() {
                break;
            }
            self.alarms.pop();
        }
    }
}

struct TimerInner<C> {
    name: String,
    time_source: Arc<dyn TimeSource>,
    state: Mutex<TimerState<C>>,
    wake: Condvar,
    running: AtomicBool,
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Alarm scheduler over one logical clock.
pub struct Timer<C: LogicalClock> {
    inner: Arc<TimerInner<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: LogicalClock> Timer<C> {
    /// Create a stopped timer. Call [`start`](Self::start) to run the
    /// alarm thread, or drive it with [`run_due_alarms`](Self::run_due_alarms).
    pub fn new(name: impl Into<String>, clock: C, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                name: name.into(),
                time_source,
                state: Mutex::new(TimerState {
                    clock,
                    alarms: BinaryHeap::new(),
                    next_seq: 0,
                }),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current time in this timer's time base (ratcheted).
    pub fn current_time_millis(&self) -> i64 {
        self.inner.current_time_millis()
    }

    /// Schedule an alarm.
    pub fn add_alarm(&self, alarm: Arc<dyn Alarm>) {
        let expiration = alarm.expiration_time();
        self.inner.state.lock().push(expiration, alarm);
        self.inner.wake.notify_all();
    }

    /// Schedule a closure at absolute time `at`.
    pub fn schedule_at(&self, at: i64, f: impl FnOnce() + Send + 'static) -> Arc<CallbackAlarm> {
        let alarm = Arc::new(CallbackAlarm::new(at, f));
        self.add_alarm(alarm.clone());
        alarm
    }

    /// Schedule a closure `delay` milliseconds from now.
    pub fn schedule_in(&self, delay: i64, f: impl FnOnce() + Send + 'static) -> Arc<CallbackAlarm> {
        self.schedule_at(self.current_time_millis() + delay, f)
    }

    /// Schedule a closure every `period` milliseconds, first after one period.
    pub fn schedule_periodic(
        &self,
        period: i64,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Arc<PeriodicAlarm> {
        let alarm = Arc::new(PeriodicAlarm::new(
            self.current_time_millis() + period,
            period,
            f,
        ));
        self.add_alarm(alarm.clone());
        alarm
    }

    /// Cancel an alarm. The heap entry is discarded lazily.
    pub fn cancel_alarm(&self, alarm: &dyn Alarm) -> bool {
        let cancelled = alarm.cancel();
        if cancelled {
            self.inner.wake.notify_all();
        }
        cancelled
    }

    /// Number of scheduled, uncancelled alarms.
    pub fn pending_alarms(&self) -> usize {
        self.inner
            .state
            .lock()
            .alarms
            .iter()
            .filter(|Reverse(s)| !s.alarm.is_cancelled())
            .count()
    }

    /// Ring every alarm that is due now; returns how many rang.
    pub fn run_due_alarms(&self) -> usize {
        self.inner.run_due_alarms()
    }

    /// Real-time wait until the next alarm or parameter change.
    pub fn next_wait(&self) -> Duration {
        let mut state = self.inner.state.lock();
        self.inner.compute_wait(&mut state)
    }

    /// Start the background alarm thread.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.inner.running.store(true, AtomicOrdering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("timer-{}", self.inner.name))
            .spawn(move || inner.run())
            .expect("Failed to spawn timer thread");
        *worker = Some(handle);
    }

    /// Stop the background thread and wait for it.
    pub fn stop(&self) {
        self.inner.running.store(false, AtomicOrdering::SeqCst);
        self.inner.wake.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // An alarm may drop the last owner of its own timer.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Timer '{}': alarm thread panicked", self.inner.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(AtomicOrdering::SeqCst)
    }

    fn with_clock<R>(&self, f: impl FnOnce(&mut C, i64) -> R) -> R {
        let now = self.inner.time_source.now_millis();
        let result = f(&mut self.inner.state.lock().clock, now);
        self.inner.wake.notify_all();
        result
    }
}

impl<C: LogicalClock> Drop for Timer<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: LogicalClock> TimerInner<C> {
    fn current_time_millis(&self) -> i64 {
        let now = self.time_source.now_millis();
        self.state.lock().clock.current_time_millis(now)
    }

    fn run_due_alarms(&self) -> usize {
        let due: Vec<Arc<dyn Alarm>> = {
            let mut state = self.state.lock();
            let now = state.clock.current_time_millis(self.time_source.now_millis());
            let mut due = Vec::new();
            while let Some(Reverse(top)) = state.alarms.peek() {
                if top.expiration > now {
                    break;
                }
                if let Some(Reverse(entry)) = state.alarms.pop() {
                    if !entry.alarm.is_cancelled() {
                        due.push(entry.alarm);
                    }
                }
            }
            due
        };

        let rang = due.len();
        for alarm in due {
            if alarm.is_cancelled() {
                continue;
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| alarm.expire()));
            match result {
                Ok(Some(next)) => self.state.lock().push(next, alarm),
                Ok(None) => {}
                Err(e) => log::error!("Timer '{}': alarm panic: {:?}", self.name, e),
            }
        }
        rang
    }

    fn compute_wait(&self, state: &mut TimerState<C>) -> Duration {
        state.prune();
        let real_now = self.time_source.now_millis();
        let now = state.clock.current_time_millis(real_now);

        let mut wait = match state.alarms.peek() {
            Some(Reverse(next)) => {
                let delta = (next.expiration - now).max(0);
                state.clock.real_delay_for(delta).unwrap_or(MAX_WAIT_MS)
            }
            None => MAX_WAIT_MS,
        };
        if let Some(change) = state.clock.next_change_time() {
            wait = wait.min((change - real_now).max(0));
        }
        Duration::from_millis(wait.clamp(0, MAX_WAIT_MS) as u64)
    }

    fn run(&self) {
        log::debug!("Timer '{}': alarm thread started", self.name);
        while self.running.load(AtomicOrdering::SeqCst) {
            self.run_due_alarms();
            let mut state = self.state.lock();
            if !self.running.load(AtomicOrdering::SeqCst) {
                break;
            }
            let wait = self.compute_wait(&mut state);
            if !wait.is_zero() {
                self.wake.wait_for(&mut state, wait);
            }
        }
        log::debug!("Timer '{}': alarm thread stopped", self.name);
    }
}

// ---------------------------------------------------------------------------
// Flavours
// ---------------------------------------------------------------------------

impl Timer<WallClock> {
    /// Real-time timer over `time_source`.
    pub fn real_time(name: impl Into<String>, time_source: Arc<dyn TimeSource>) -> Self {
        Self::new(name, WallClock::new(), time_source)
    }
}

impl Timer<ExecutionClock> {
    /// Execution timer starting equal to real time.
    pub fn execution(
        name: impl Into<String>,
        time_source: Arc<dyn TimeSource>,
        capacity: usize,
    ) -> Self {
        Self::new(
            name,
            ExecutionClock::new(TimerParameters::identity(), capacity),
            time_source,
        )
    }

    /// Queue a parameter set (e.g. one received from another agent).
    pub fn set_parameters(&self, params: TimerParameters) -> bool {
        self.with_clock(|clock, now| clock.add_parameters(params, now))
    }

    /// Parameters currently in effect.
    pub fn parameters(&self) -> TimerParameters {
        self.with_clock(|clock, now| clock.current_parameters(now))
    }

    /// Build the parameters realising `change`, continuous with the clock as
    /// it will stand at the change time, and queue them.
    ///
    /// Returns the new parameters so they can be broadcast to other agents.
    pub fn change_time(&self, change: &TimeChange) -> TimerParameters {
        self.with_clock(|clock, now| {
            let at = now + change.change_delay.max(0);
            let base = clock.parameters_at(at);
            let current = base.compute(at);
            let target = match change.jump {
                TimeJump::None => current,
                TimeJump::Relative(delta) => current + delta,
                TimeJump::Absolute(value) => value,
            };
            let rate = change.rate.unwrap_or(base.rate);
            let params = TimerParameters::anchored(target, at, rate);
            if !clock.add_parameters(params, now) {
                log::warn!("ExecutionTimer: time change {:?} was not applied", change);
            }
            params
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manual(start: i64) -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource::new(start))
    }

    #[test]
    fn test_due_alarms_ring_in_order() {
        let src = manual(1_000);
        let timer = RealTimeTimer::real_time("t", src.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        for at in [1_300, 1_100, 1_200] {
            let log = log.clone();
            timer.schedule_at(at, move || log.lock().push(at));
        }
        assert_eq!(timer.run_due_alarms(), 0);

        src.set(1_250);
        assert_eq!(timer.run_due_alarms(), 2);
        assert_eq!(*log.lock(), vec![1_100, 1_200]);
        assert_eq!(timer.pending_alarms(), 1);
    }

    #[test]
    fn test_cancelled_alarm_does_not_ring() {
        let src = manual(0);
        let timer = RealTimeTimer::real_time("t", src.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let alarm = timer.schedule_at(10, move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert!(timer.cancel_alarm(alarm.as_ref()));
        src.set(20);
        assert_eq!(timer.run_due_alarms(), 0);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(timer.pending_alarms(), 0);
    }

    #[test]
    fn test_alarm_may_schedule_on_same_timer() {
        let src = manual(0);
        let timer = Arc::new(RealTimeTimer::real_time("t", src.clone()));
        let hits = Arc::new(AtomicUsize::new(0));

        let t = Arc::downgrade(&timer);
        let h = hits.clone();
        timer.schedule_at(5, move || {
            if let Some(t) = t.upgrade() {
                let h = h.clone();
                t.schedule_at(6, move || {
                    h.fetch_add(1, AtomicOrdering::SeqCst);
                });
            }
        });
        src.set(10);
        assert_eq!(timer.run_due_alarms(), 1);
        assert_eq!(timer.run_due_alarms(), 1);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_alarm_rearms() {
        let src = manual(0);
        let timer = RealTimeTimer::real_time("t", src.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let alarm = timer.schedule_periodic(100, move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        });
        src.set(100);
        timer.run_due_alarms();
        src.set(200);
        timer.run_due_alarms();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(alarm.expiration_time(), 300);
        timer.cancel_alarm(alarm.as_ref());
        assert_eq!(timer.pending_alarms(), 0);
    }

    #[test]
    fn test_wait_scales_with_rate_and_change_time() {
        let src = manual(0);
        let timer = ExecutionTimer::execution("x", src.clone(), DEFAULT_PARAMETER_CAPACITY);
        timer.set_parameters(TimerParameters::anchored(0, 0, 0.5));
        timer.schedule_at(100, || {});
        assert_eq!(timer.next_wait(), Duration::from_millis(200));

        // Paused clock: only the next parameter change bounds the wait.
        timer.set_parameters(TimerParameters::anchored(0, 1, 0.0));
        src.set(1);
        timer.set_parameters(TimerParameters::anchored(0, 51, 1.0));
        assert_eq!(timer.next_wait(), Duration::from_millis(50));
    }

    #[test]
    fn test_change_time_jump_and_pause() {
        let src = manual(10_000);
        let timer = ExecutionTimer::execution("x", src.clone(), DEFAULT_PARAMETER_CAPACITY);
        assert_eq!(timer.current_time_millis(), 10_000);

        timer.change_time(&TimeChange::advance(5_000));
        assert_eq!(timer.current_time_millis(), 15_000);

        let paused = timer.change_time(&TimeChange::pause().with_delay(100));
        assert_eq!(paused.rate, 0.0);
        src.advance(1_000);
        let frozen = timer.current_time_millis();
        assert_eq!(frozen, 15_100);
        src.advance(1_000);
        assert_eq!(timer.current_time_millis(), frozen);
        assert_eq!(timer.parameters().rate, 0.0);
    }

    #[test]
    fn test_monotonic_under_parameter_churn() {
        let src = manual(0);
        let timer = ExecutionTimer::execution("x", src.clone(), DEFAULT_PARAMETER_CAPACITY);
        let mut last = timer.current_time_millis();
        for step in 0..200i64 {
            if step % 7 == 0 {
                let jump = if step % 2 == 0 { -3_000 } else { 1_000 };
                timer.change_time(&TimeChange::advance(jump));
            }
            if step % 11 == 0 {
                timer.change_time(&TimeChange::set_rate((step % 3) as f64));
            }
            src.advance(13);
            let now = timer.current_time_millis();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_background_thread_rings_alarm() {
        let timer = RealTimeTimer::real_time("bg", Arc::new(SystemTimeSource));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        timer.start();
        timer.schedule_in(20, move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        });
        for _ in 0..100 {
            if hits.load(AtomicOrdering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        timer.stop();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
        assert!(!timer.is_running());
    }
}
