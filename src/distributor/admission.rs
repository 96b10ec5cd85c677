//! Transaction admission gate.
//!
//! Counts open transactions per thread. While a checkpoint is pending, new
//! transactions wait here unless their thread already holds one (a thread
//! nesting transactions on two subscribers must not block on a checkpoint
//! that is waiting for it).

use std::collections::HashMap;
use std::thread::ThreadId;

#[derive(Debug, Default)]
pub(crate) struct Admission {
    holders: HashMap<ThreadId, usize>,
    /// New transactions are held back.
    pub persist_pending: bool,
    /// A checkpoint is running or has claimed the right to run.
    pub checkpointing: bool,
}

impl Admission {
    /// Total open transactions.
    pub fn open(&self) -> usize {
        self.holders.values().sum()
    }

    /// Open transactions not owned by `thread`.
    pub fn open_by_others(&self, thread: ThreadId) -> usize {
        self.holders
            .iter()
            .filter(|(t, _)| **t != thread)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn holds(&self, thread: ThreadId) -> bool {
        self.holders.contains_key(&thread)
    }

    pub fn admit(&mut self, thread: ThreadId) {
        *self.holders.entry(thread).or_default() += 1;
    }

    /// Returns false if `thread` held nothing.
    pub fn release(&mut self, thread: ThreadId) -> bool {
        match self.holders.get_mut(&thread) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.holders.remove(&thread);
                true
            }
            None => false,
        }
    }

    /// Claim the right to run a pending checkpoint now.
    pub fn claim_pending_checkpoint(&mut self) -> bool {
        if self.persist_pending && !self.checkpointing && self.open() == 0 {
            self.checkpointing = true;
            true
        } else {
            false
        }
    }
}
