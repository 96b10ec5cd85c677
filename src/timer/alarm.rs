//! Alarms rung by a [`Timer`](super::Timer).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;

/// Something to run once a timer's clock reaches an expiration time.
///
/// Cancellation is best-effort: the timer checks
/// [`is_cancelled`](Self::is_cancelled) right before ringing, so an alarm
/// cancelled while it is already being rung still runs to completion.
pub trait Alarm: Send + Sync {
    /// Absolute expiration, in the owning timer's time base.
    fn expiration_time(&self) -> i64;

    /// Ring the alarm. A repeating alarm returns its next expiration.
    fn expire(&self) -> Option<i64>;

    /// Cancel; returns false if it was already cancelled or rung.
    fn cancel(&self) -> bool;

    fn is_cancelled(&self) -> bool;
}

type OnceCallback = Box<dyn FnOnce() + Send>;

/// One-shot alarm running a closure.
pub struct CallbackAlarm {
    expiration: i64,
    callback: Mutex<Option<OnceCallback>>,
    cancelled: AtomicBool,
}

impl CallbackAlarm {
    pub fn new(expiration: i64, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            expiration,
            callback: Mutex::new(Some(Box::new(callback))),
            cancelled: AtomicBool::new(false),
        }
    }

    /// True once the callback has run.
    pub fn has_expired(&self) -> bool {
        self.callback.lock().is_none() && !self.is_cancelled()
    }
}

impl Alarm for CallbackAlarm {
    fn expiration_time(&self) -> i64 {
        self.expiration
    }

    fn expire(&self) -> Option<i64> {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        None
    }

    fn cancel(&self) -> bool {
        if self.callback.lock().is_none() {
            return false;
        }
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CallbackAlarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAlarm")
            .field("expiration", &self.expiration)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type RepeatCallback = Box<dyn Fn() + Send + Sync>;

/// Alarm that re-arms itself every `period` after ringing.
pub struct PeriodicAlarm {
    next: AtomicI64,
    period: i64,
    callback: RepeatCallback,
    cancelled: AtomicBool,
}

impl PeriodicAlarm {
    pub fn new(first: i64, period: i64, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            next: AtomicI64::new(first),
            period: period.max(1),
            callback: Box::new(callback),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn period(&self) -> i64 {
        self.period
    }
}

impl Alarm for PeriodicAlarm {
    fn expiration_time(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    fn expire(&self) -> Option<i64> {
        (self.callback)();
        if self.is_cancelled() {
            return None;
        }
        Some(self.next.fetch_add(self.period, Ordering::SeqCst) + self.period)
    }

    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PeriodicAlarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicAlarm")
            .field("next", &self.expiration_time())
            .field("period", &self.period)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
