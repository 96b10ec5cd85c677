//! Envelopes waiting for a subscriber's next transaction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::envelope::Envelope;

/// The distributor appends; the owning subscriber moves the whole buffer
/// to `in_flight` when it opens a transaction and clears it at close.
///
/// Checkpoints record both buffers, so envelopes a transaction was applying
/// are delivered again after a restart.
#[derive(Debug)]
pub struct Inbox {
    name: String,
    pending: Mutex<Vec<Arc<Envelope>>>,
    in_flight: Mutex<Vec<Arc<Envelope>>>,
    arrived: Condvar,
}

impl Inbox {
    pub(crate) fn new(name: impl Into<String>, pending: Vec<Arc<Envelope>>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(pending),
            in_flight: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push(&self, envelope: Arc<Envelope>) {
        self.pending.lock().push(envelope);
        self.arrived.notify_all();
    }

    /// Move everything pending in flight and return it, oldest first.
    pub(crate) fn begin_transaction(&self) -> Vec<Arc<Envelope>> {
        let taken = std::mem::take(&mut *self.pending.lock());
        let mut in_flight = self.in_flight.lock();
        in_flight.clear();
        in_flight.extend(taken.iter().cloned());
        taken
    }

    /// The transaction applying the in-flight envelopes has closed.
    pub(crate) fn end_transaction(&self) {
        self.in_flight.lock().clear();
    }

    /// In-flight then pending envelopes, as a checkpoint records them.
    pub(crate) fn undelivered(&self) -> Vec<Envelope> {
        let in_flight = self.in_flight.lock();
        let pending = self.pending.lock();
        in_flight
            .iter()
            .chain(pending.iter())
            .map(|e| (**e).clone())
            .collect()
    }

    /// Run `f` over the pending envelopes, oldest first.
    pub(crate) fn with_pending<R>(&self, f: impl FnOnce(&[Arc<Envelope>]) -> R) -> R {
        f(&self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until something is pending or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            self.arrived.wait_for(&mut pending, timeout);
        }
        !pending.is_empty()
    }
}
