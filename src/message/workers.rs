//! Background maintenance threads for a [`MessageManager`].
//!
//! Three threads per manager: the retransmitter, the ack sender and the
//! keep-alive sender. Each wakes on a poke or after a bounded timeout,
//! collects what is due and puts it on the transport outside the manager
//! lock. The threads hold only a weak reference, so dropping the last
//! strong reference to the manager ends them.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use super::manager::MessageManager;
use super::transport::MessageTransport;
use super::types::Message;

/// Longest a worker sleeps before re-checking.
const MAX_WORKER_WAIT: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Retransmitter,
    AckSender,
    KeepAlive,
}

impl WorkerKind {
    fn name(self) -> &'static str {
        match self {
            Self::Retransmitter => "retransmitter",
            Self::AckSender => "ack-sender",
            Self::KeepAlive => "keep-alive",
        }
    }

    fn collect(self, mm: &MessageManager) -> Vec<Message> {
        match self {
            Self::Retransmitter => mm.due_retransmissions(),
            Self::AckSender => mm.take_due_acks(),
            Self::KeepAlive => mm.due_keep_alives(),
        }
    }

    fn wait(self, mm: &MessageManager) -> Duration {
        match self {
            Self::AckSender => MAX_WORKER_WAIT,
            Self::Retransmitter | Self::KeepAlive => mm.next_deadline(MAX_WORKER_WAIT),
        }
    }
}

impl MessageManager {
    /// Spawn the maintenance threads. Calling it twice is a no-op.
    pub fn start_workers(self: &Arc<Self>, transport: Arc<dyn MessageTransport>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for kind in [
            WorkerKind::Retransmitter,
            WorkerKind::AckSender,
            WorkerKind::KeepAlive,
        ] {
            let weak = Arc::downgrade(self);
            let transport = Arc::clone(&transport);
            let handle = thread::Builder::new()
                .name(format!("mm-{}-{}", self.agent(), kind.name()))
                .spawn(move || worker_loop(weak, transport, kind))
                .expect("Failed to spawn message manager worker thread");
            workers.push(handle);
        }
        log::debug!("MessageManager[{}]: workers started", self.agent());
    }

    /// Stop and join the maintenance threads.
    pub fn stop_workers(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.poke.notify_all();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                log::error!("MessageManager[{}]: worker panicked", self.agent());
            }
        }
    }

    pub fn workers_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Put messages on the wire; failures are logged, retransmission covers
    /// the loss.
    pub fn transmit(&self, transport: &dyn MessageTransport, messages: Vec<Message>) {
        for message in messages {
            let destination = message.destination().clone();
            if let Err(e) = transport.send(message) {
                log::debug!(
                    "MessageManager[{}]: send to {} failed: {}",
                    self.agent(),
                    destination,
                    e
                );
            }
        }
    }

    fn wait_for_poke(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.poke.wait_for(&mut state, timeout);
    }
}

fn worker_loop(mm: Weak<MessageManager>, transport: Arc<dyn MessageTransport>, kind: WorkerKind) {
    loop {
        let Some(mm) = mm.upgrade() else {
            break;
        };
        if !mm.running.load(Ordering::SeqCst) {
            break;
        }
        let due = kind.collect(&mm);
        mm.transmit(transport.as_ref(), due);
        let wait = kind.wait(&mm).max(Duration::from_millis(1));
        mm.wait_for_poke(wait);
    }
    log::debug!("MessageManager worker '{}' exiting", kind.name());
}
