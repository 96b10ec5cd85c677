//! Re-entrant transaction lock and the scoped [`Transaction`] guard.

use std::ops::Deref;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::Subscriber;
use crate::errors::TransactionError;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Per-subscriber lock owned by the thread that opened the transaction.
///
/// Nested acquisitions by the owner only bump a depth counter; other
/// threads block until the outermost release.
#[derive(Debug)]
pub struct TransactionLock {
    subscriber: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl TransactionLock {
    pub fn new(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire for the current thread; returns the new depth (1 = outermost).
    pub fn acquire(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner != me => self.released.wait(&mut state),
                _ => break,
            }
        }
        state.owner = Some(me);
        state.depth += 1;
        state.depth
    }

    /// Depth held by the current thread, or why it holds nothing.
    pub fn depth(&self) -> Result<usize, TransactionError> {
        let state = self.state.lock();
        match state.owner {
            None => Err(TransactionError::NotOpen {
                subscriber: self.subscriber.clone(),
            }),
            Some(owner) if owner != thread::current().id() => Err(TransactionError::NotOwner {
                subscriber: self.subscriber.clone(),
            }),
            Some(_) => Ok(state.depth),
        }
    }

    /// Release one level; returns the remaining depth.
    pub fn release(&self) -> Result<usize, TransactionError> {
        self.depth()?;
        let mut state = self.state.lock();
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        Ok(state.depth)
    }

    /// Drop ownership regardless of depth or owner.
    pub(crate) fn force_release(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        state.depth = 0;
        self.released.notify_all();
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner() == Some(thread::current().id())
    }
}

/// An open transaction on a [`Subscriber`], closed when dropped.
///
/// # Example
///
/// ```rust,no_run
/// # use agent_blackboard::subscriber::Subscriber;
/// # fn demo(subscriber: &Subscriber, obj: agent_blackboard::blackboard::ObjectRef) {
/// {
///     let txn = subscriber.transaction();
///     txn.publish_add(obj);
/// } // closed: the outbox goes to the distributor
/// # }
/// ```
pub struct Transaction<'a> {
    subscriber: &'a Subscriber,
    closed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(subscriber: &'a Subscriber) -> Self {
        subscriber.open_transaction();
        Self {
            subscriber,
            closed: false,
        }
    }

    /// Close now and surface the result instead of logging it.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.closed = true;
        self.subscriber.close_transaction()
    }
}

impl Deref for Transaction<'_> {
    type Target = Subscriber;

    fn deref(&self) -> &Subscriber {
        self.subscriber
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.subscriber.close_transaction() {
            log::error!("Transaction on '{}' failed to close: {}", self.subscriber.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_depth() {
        let lock = TransactionLock::new("s");
        assert_eq!(lock.acquire(), 1);
        assert_eq!(lock.acquire(), 2);
        assert_eq!(lock.release().unwrap(), 1);
        assert!(lock.is_held_by_current_thread());
        assert_eq!(lock.release().unwrap(), 0);
        assert_eq!(lock.owner(), None);
        assert!(matches!(lock.release(), Err(TransactionError::NotOpen { .. })));
    }

    #[test]
    fn test_other_thread_cannot_release() {
        let lock = Arc::new(TransactionLock::new("s"));
        lock.acquire();
        let other = lock.clone();
        let result = thread::spawn(move || other.release()).join().unwrap();
        assert!(matches!(result, Err(TransactionError::NotOwner { .. })));
        assert_eq!(lock.release().unwrap(), 0);
    }

    #[test]
    fn test_second_thread_waits_for_release() {
        let lock = Arc::new(TransactionLock::new("s"));
        lock.acquire();
        let other = lock.clone();
        let waiter = thread::spawn(move || {
            let depth = other.acquire();
            other.release().unwrap();
            depth
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        lock.release().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
