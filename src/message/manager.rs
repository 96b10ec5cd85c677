//! Reliable directive delivery.
//!
//! The [`MessageManager`] turns directives into sequenced
//! [`DirectiveMessage`]s per destination, classifies incoming messages
//! (in order / duplicate / future / stale / restart / desync), tracks
//! acknowledgements in both directions and decides what must be resent.
//!
//! Acknowledgements are tied to durability: receiving a message only marks
//! it in the connection's [`AckSet`](super::AckSet). It becomes ackable
//! once the distributor has checkpointed and calls
//! [`commit_acks`](MessageManager::commit_acks).
//!
//! Sending is tied to durability the same way when the agent checkpoints:
//! a [holding](MessageManager::holding_sends) manager sequences new
//! messages but keeps them back until
//! [`commit_sends`](MessageManager::commit_sends) confirms a stored
//! checkpoint covers them. A restarted agent therefore never reuses a
//! sequence number its peers have already seen.
//!
//! All methods are synchronous and take the real time from the injected
//! [`TimeSource`]; the background workers in [`workers`](super::workers)
//! only call [`due_retransmissions`](MessageManager::due_retransmissions),
//! [`take_due_acks`](MessageManager::take_due_acks) and
//! [`due_keep_alives`](MessageManager::due_keep_alives) and hand the result
//! to a transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::connection::{PeerConnection, TimestampedMessage};
use super::types::{AckMessage, Directive, DirectiveMessage, Message, PeerId, ReceiveStatus};
use crate::config::MessagingConfig;
use crate::timer::TimeSource;

/// Serialisable snapshot of every peer connection, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageManagerState {
    pub agent: PeerId,
    pub incarnation: i64,
    pub connections: BTreeMap<PeerId, PeerConnection>,
}

#[derive(Debug)]
pub(super) struct ManagerState {
    pub(super) incarnation: i64,
    pub(super) connections: BTreeMap<PeerId, PeerConnection>,
}

/// Per-agent reliable messaging state machine.
pub struct MessageManager {
    agent: PeerId,
    config: MessagingConfig,
    time_source: Arc<dyn TimeSource>,
    hold_sends: bool,
    pub(super) state: Mutex<ManagerState>,
    pub(super) poke: Condvar,
    pub(super) running: AtomicBool,
    pub(super) workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageManager {
    /// A manager whose incarnation is the current real time.
    pub fn new(agent: impl Into<PeerId>, config: MessagingConfig, time_source: Arc<dyn TimeSource>) -> Self {
        // 0 means "not yet known" on the remote side.
        let incarnation = time_source.now_millis().max(1);
        Self::with_incarnation(agent, config, time_source, incarnation)
    }

    pub fn with_incarnation(
        agent: impl Into<PeerId>,
        config: MessagingConfig,
        time_source: Arc<dyn TimeSource>,
        incarnation: i64,
    ) -> Self {
        Self {
            agent: agent.into(),
            config,
            time_source,
            hold_sends: false,
            state: Mutex::new(ManagerState {
                incarnation,
                connections: BTreeMap::new(),
            }),
            poke: Condvar::new(),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Keep newly sequenced messages back until a checkpoint covers them.
    pub fn holding_sends(mut self, hold: bool) -> Self {
        self.hold_sends = hold;
        self
    }

    pub fn agent(&self) -> &PeerId {
        &self.agent
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Incarnation used for new connections.
    pub fn incarnation(&self) -> i64 {
        self.state.lock().incarnation
    }

    pub(super) fn now(&self) -> i64 {
        self.time_source.now_millis()
    }

    /// Wake the workers.
    pub fn poke(&self) {
        self.poke.notify_all();
    }

    /// Copy of one peer's connection.
    pub fn connection(&self, peer: &PeerId) -> Option<PeerConnection> {
        self.state.lock().connections.get(peer).cloned()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Outstanding entry for a newly sequenced message, due at `due`
    /// unless sends are held.
    fn pending_entry(&self, message: DirectiveMessage, due: i64) -> TimestampedMessage {
        TimestampedMessage {
            message,
            next_retry: if self.hold_sends { i64::MAX } else { due },
            retry_count: 0,
            held: self.hold_sends,
        }
    }

    /// Sequence `directives` into one message per destination.
    ///
    /// The messages are recorded as outstanding and returned for the caller
    /// to put on the wire, unless sends are held, in which case nothing is
    /// returned until [`commit_sends`](Self::commit_sends).
    pub fn send_directives(&self, directives: Vec<Directive>) -> Vec<Message> {
        if directives.is_empty() {
            return Vec::new();
        }
        let mut by_destination: BTreeMap<PeerId, Vec<Directive>> = BTreeMap::new();
        for directive in directives {
            by_destination
                .entry(directive.destination.clone())
                .or_default()
                .push(directive);
        }

        let now = self.now();
        let first_delay = self.config.retry_delay(0);
        let mut state = self.state.lock();
        let incarnation = state.incarnation;
        let mut out = Vec::with_capacity(by_destination.len());
        for (destination, directives) in by_destination {
            let conn = state
                .connections
                .entry(destination.clone())
                .or_insert_with(|| PeerConnection::new(incarnation, now));
            let all_acked = conn.all_acked();
            let seq = conn.next_sequence();
            let message = DirectiveMessage {
                source: self.agent.clone(),
                destination,
                incarnation: conn.local_incarnation,
                contents_id: seq,
                directives,
                all_acked,
            };
            conn.outstanding
                .insert(seq, self.pending_entry(message.clone(), now + first_delay));
            conn.last_send = now;
            if !self.hold_sends {
                out.push(Message::Directive(message));
            }
        }
        drop(state);
        self.poke();
        out
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Classify an incoming directive message and update the connection.
    pub fn receive_directive_message(&self, message: &DirectiveMessage) -> ReceiveStatus {
        let now = self.now();
        let mut state = self.state.lock();
        let incarnation = state.incarnation;
        let conn = state
            .connections
            .entry(message.source.clone())
            .or_insert_with(|| PeerConnection::new(incarnation, now));

        if conn.remote_incarnation == 0 {
            log::debug!(
                "MessageManager[{}]: first contact from {} (incarnation {})",
                self.agent,
                message.source,
                message.incarnation
            );
            conn.remote_incarnation = message.incarnation;
        } else if message.incarnation < conn.remote_incarnation {
            log::debug!(
                "MessageManager[{}]: stale message {} from {} (incarnation {} < {})",
                self.agent,
                message.contents_id,
                message.source,
                message.incarnation,
                conn.remote_incarnation
            );
            return ReceiveStatus::Stale;
        } else if message.incarnation > conn.remote_incarnation {
            log::info!(
                "MessageManager[{}]: {} restarted (incarnation {} -> {}), dropping {} outstanding",
                self.agent,
                message.source,
                conn.remote_incarnation,
                message.incarnation,
                conn.outstanding.len()
            );
            let mut fresh = PeerConnection::new(conn.local_incarnation, now);
            fresh.remote_incarnation = message.incarnation;
            *conn = fresh;
            let accepted =
                message.contents_id == 1 && conn.check_sequence(1) == ReceiveStatus::Ok;
            return ReceiveStatus::Restart { accepted };
        }

        let status = conn.check_sequence(message.contents_id);
        match status {
            ReceiveStatus::Duplicate => {
                log::debug!(
                    "MessageManager[{}]: duplicate {} from {}",
                    self.agent,
                    message.contents_id,
                    message.source
                );
                drop(state);
                self.poke();
                status
            }
            ReceiveStatus::Future => {
                // The transport may reorder, so a gap alone proves nothing.
                if !message.all_acked || conn.resync_pending {
                    log::debug!(
                        "MessageManager[{}]: future {} from {} (expected {})",
                        self.agent,
                        message.contents_id,
                        message.source,
                        conn.receive_sequence + 1
                    );
                    return status;
                }
                let local = now.max(conn.local_incarnation + 1);
                log::info!(
                    "MessageManager[{}]: lost sync with {} at {} (expected {}), resynchronising as incarnation {}",
                    self.agent,
                    message.source,
                    message.contents_id,
                    conn.receive_sequence + 1,
                    local
                );
                let mut fresh = PeerConnection::new(local, now);
                fresh.remote_incarnation = message.incarnation;
                fresh.resync_pending = true;
                let seq = fresh.next_sequence();
                let handshake = DirectiveMessage {
                    source: self.agent.clone(),
                    destination: message.source.clone(),
                    incarnation: local,
                    contents_id: seq,
                    directives: Vec::new(),
                    all_acked: true,
                };
                // Due immediately; the retransmitter sends it.
                let entry = self.pending_entry(handshake, now);
                fresh.outstanding.insert(seq, entry);
                *conn = fresh;
                drop(state);
                self.poke();
                ReceiveStatus::Desync
            }
            _ => status,
        }
    }

    /// Apply an acknowledgement; returns how many outstanding messages it
    /// released.
    pub fn receive_ack(&self, ack: &AckMessage) -> usize {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&ack.source) else {
            log::debug!("MessageManager[{}]: ack from unknown peer {}", self.agent, ack.source);
            return 0;
        };
        if conn.remote_incarnation == 0 {
            conn.remote_incarnation = ack.incarnation;
        }
        if ack.acked_incarnation != conn.local_incarnation {
            log::debug!(
                "MessageManager[{}]: ack from {} for old incarnation {}",
                self.agent,
                ack.source,
                ack.acked_incarnation
            );
            return 0;
        }
        if ack.incarnation != conn.remote_incarnation {
            log::debug!(
                "MessageManager[{}]: ack from {} carries incarnation {}, expected {}",
                self.agent,
                ack.source,
                ack.incarnation,
                conn.remote_incarnation
            );
            return 0;
        }
        conn.acknowledge(ack.ack_number)
    }

    // -----------------------------------------------------------------------
    // Acknowledgements
    // -----------------------------------------------------------------------

    /// True if some received message is not yet covered by a checkpoint.
    pub fn has_uncommitted_acks(&self) -> bool {
        self.state
            .lock()
            .connections
            .values()
            .any(PeerConnection::has_uncommitted_acks)
    }

    /// Everything received so far is durable; make it ackable.
    pub fn commit_acks(&self) -> bool {
        let mut committed = false;
        for conn in self.state.lock().connections.values_mut() {
            committed |= conn.commit_acks();
        }
        if committed {
            self.poke();
        }
        committed
    }

    /// Build the acknowledgements that are due and clear their flags.
    pub fn take_due_acks(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for (peer, conn) in state.connections.iter_mut() {
            if !conn.ack_due {
                continue;
            }
            conn.ack_due = false;
            if conn.remote_incarnation == 0 || conn.durable_ack == 0 {
                continue;
            }
            out.push(Message::Ack(AckMessage {
                source: self.agent.clone(),
                destination: peer.clone(),
                incarnation: conn.local_incarnation,
                acked_incarnation: conn.remote_incarnation,
                ack_number: conn.durable_ack,
            }));
        }
        out
    }

    /// True if some sequenced message waits for a checkpoint.
    pub fn has_held_sends(&self) -> bool {
        self.state
            .lock()
            .connections
            .values()
            .any(PeerConnection::has_held)
    }

    /// Release the held messages that `covered` (the snapshot a stored
    /// checkpoint was taken from) records, and return them for sending.
    ///
    /// Messages sequenced after the snapshot stay held for the next
    /// checkpoint.
    pub fn commit_sends(&self, covered: &MessageManagerState) -> Vec<Message> {
        let now = self.now();
        let first_delay = self.config.retry_delay(0);
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for (peer, conn) in state.connections.iter_mut() {
            let Some(recorded) = covered.connections.get(peer) else {
                continue;
            };
            if recorded.local_incarnation != conn.local_incarnation {
                continue;
            }
            let released = out.len();
            for (seq, pending) in conn.outstanding.iter_mut() {
                if !pending.held || *seq > recorded.transmit_sequence {
                    continue;
                }
                pending.held = false;
                pending.next_retry = now + first_delay;
                out.push(Message::Directive(pending.message.clone()));
            }
            if out.len() > released {
                conn.last_send = now;
            }
        }
        drop(state);
        if !out.is_empty() {
            log::debug!(
                "MessageManager[{}]: {} held messages now durable",
                self.agent,
                out.len()
            );
            self.poke();
        }
        out
    }

    // -----------------------------------------------------------------------
    // Retransmission and keep-alive
    // -----------------------------------------------------------------------

    /// Outstanding messages whose retry time has come, resent verbatim.
    pub fn due_retransmissions(&self) -> Vec<Message> {
        let now = self.now();
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for conn in state.connections.values_mut() {
            let mut resent = false;
            for pending in conn.outstanding.values_mut() {
                if pending.held || pending.next_retry > now {
                    continue;
                }
                pending.retry_count += 1;
                pending.next_retry = now + self.config.retry_delay(pending.retry_count);
                log::debug!(
                    "MessageManager[{}]: resending {} to {} (attempt {})",
                    self.agent,
                    pending.message.contents_id,
                    pending.message.destination,
                    pending.retry_count
                );
                out.push(Message::Directive(pending.message.clone()));
                resent = true;
            }
            if resent {
                conn.last_send = now;
            }
        }
        out
    }

    /// Zero-directive messages for peers idle longer than the keep-alive
    /// interval with nothing outstanding.
    pub fn due_keep_alives(&self) -> Vec<Message> {
        let now = self.now();
        let interval = self.config.keep_alive_interval as i64;
        let first_delay = self.config.retry_delay(0);
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for (peer, conn) in state.connections.iter_mut() {
            if !conn.outstanding.is_empty() || now - conn.last_send < interval {
                continue;
            }
            let seq = conn.next_sequence();
            let message = DirectiveMessage {
                source: self.agent.clone(),
                destination: peer.clone(),
                incarnation: conn.local_incarnation,
                contents_id: seq,
                directives: Vec::new(),
                all_acked: true,
            };
            conn.outstanding
                .insert(seq, self.pending_entry(message.clone(), now + first_delay));
            conn.last_send = now;
            if !self.hold_sends {
                out.push(Message::Directive(message));
            }
        }
        out
    }

    /// Real time until the earliest retransmission or keep-alive, capped.
    pub fn next_deadline(&self, cap: Duration) -> Duration {
        let now = self.now();
        let interval = self.config.keep_alive_interval as i64;
        let state = self.state.lock();
        let earliest = state
            .connections
            .values()
            .map(|c| c.next_retry().unwrap_or(c.last_send + interval))
            .min();
        match earliest {
            Some(at) => Duration::from_millis((at - now).max(0) as u64).min(cap),
            None => cap,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Snapshot for a checkpoint.
    pub fn snapshot(&self) -> MessageManagerState {
        let state = self.state.lock();
        MessageManagerState {
            agent: self.agent.clone(),
            incarnation: state.incarnation,
            connections: state.connections.clone(),
        }
    }

    /// Resume from a checkpointed snapshot, keeping its incarnation so peers
    /// see a continuation rather than a restart.
    ///
    /// Outstanding messages are scheduled for immediate resend and the
    /// durable ack level is re-announced.
    pub fn restore(&self, snapshot: MessageManagerState) {
        if snapshot.agent != self.agent {
            log::warn!(
                "MessageManager[{}]: restoring state recorded for {}",
                self.agent,
                snapshot.agent
            );
        }
        let now = self.now();
        let mut state = self.state.lock();
        state.incarnation = snapshot.incarnation;
        state.connections = snapshot.connections;
        for conn in state.connections.values_mut() {
            // Everything in a checkpoint is durable.
            for pending in conn.outstanding.values_mut() {
                pending.held = false;
                pending.next_retry = now;
            }
            conn.ack_due = conn.durable_ack > 0;
        }
        log::info!(
            "MessageManager[{}]: restored {} connections (incarnation {})",
            self.agent,
            state.connections.len(),
            state.incarnation
        );
        drop(state);
        self.poke();
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.poke.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageCodec;
    use crate::timer::ManualTimeSource;

    struct Pair {
        clock: Arc<ManualTimeSource>,
        a: MessageManager,
        b: MessageManager,
    }

    fn pair() -> Pair {
        let clock = Arc::new(ManualTimeSource::new(0));
        let a = MessageManager::with_incarnation("a", MessagingConfig::default(), clock.clone(), 1_000);
        let b = MessageManager::with_incarnation("b", MessagingConfig::default(), clock.clone(), 1_500);
        Pair { clock, a, b }
    }

    fn directive(n: i64) -> Directive {
        Directive::new("a", "b", "task", serde_json::json!({ "n": n }))
    }

    fn as_directive(m: &Message) -> &DirectiveMessage {
        match m {
            Message::Directive(d) => d,
            Message::Ack(_) => panic!("expected directive message"),
        }
    }

    fn as_ack(m: &Message) -> &AckMessage {
        match m {
            Message::Ack(a) => a,
            Message::Directive(_) => panic!("expected ack"),
        }
    }

    #[test]
    fn test_transmit_sequence_strictly_increases() {
        let p = pair();
        let mut last = 0;
        for n in 0..10 {
            let sent = p.a.send_directives(vec![directive(n)]);
            let seq = as_directive(&sent[0]).contents_id;
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn test_directives_grouped_per_destination() {
        let p = pair();
        let sent = p.a.send_directives(vec![
            directive(1),
            Directive::new("a", "c", "task", serde_json::Value::Null),
            directive(2),
        ]);
        assert_eq!(sent.len(), 2);
        let to_b = sent.iter().map(as_directive).find(|m| m.destination.as_str() == "b").unwrap();
        assert_eq!(to_b.directives.len(), 2);
        assert!(to_b.all_acked);
    }

    #[test]
    fn test_in_order_receive_and_durable_ack() {
        let p = pair();
        let sent = p.a.send_directives(vec![directive(1)]);
        let msg = as_directive(&sent[0]);

        assert_eq!(p.b.receive_directive_message(msg), ReceiveStatus::Ok);
        // Not durable yet: nothing to ack.
        assert!(p.b.take_due_acks().is_empty());
        assert!(p.b.has_uncommitted_acks());

        assert!(p.b.commit_acks());
        let acks = p.b.take_due_acks();
        let ack = as_ack(&acks[0]);
        assert_eq!(ack.ack_number, 1);
        assert_eq!(ack.acked_incarnation, 1_000);
        assert_eq!(ack.incarnation, 1_500);

        assert_eq!(p.a.receive_ack(ack), 1);
        assert!(p.a.connection(&"b".into()).unwrap().outstanding.is_empty());
    }

    #[test]
    fn test_ack_releases_prefix_only() {
        let p = pair();
        let mut sent = Vec::new();
        for n in 0..5 {
            sent.extend(p.a.send_directives(vec![directive(n)]));
        }
        for m in &sent[..3] {
            p.b.receive_directive_message(as_directive(m));
        }
        p.b.commit_acks();
        let acks = p.b.take_due_acks();
        assert_eq!(p.a.receive_ack(as_ack(&acks[0])), 3);
        let conn = p.a.connection(&"b".into()).unwrap();
        assert_eq!(conn.outstanding.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_duplicate_is_reacked_at_durable_level() {
        let p = pair();
        let sent = p.a.send_directives(vec![directive(1)]);
        let msg = as_directive(&sent[0]);
        p.b.receive_directive_message(msg);
        p.b.commit_acks();
        p.b.take_due_acks();

        assert_eq!(p.b.receive_directive_message(msg), ReceiveStatus::Duplicate);
        let acks = p.b.take_due_acks();
        assert_eq!(as_ack(&acks[0]).ack_number, 1);
    }

    #[test]
    fn test_lost_message_is_resent_byte_identical() {
        let p = pair();
        let first = p.a.send_directives(vec![directive(1)]);
        p.b.receive_directive_message(as_directive(&first[0]));
        p.b.commit_acks();
        p.a.receive_ack(as_ack(&p.b.take_due_acks()[0]));

        let second = p.a.send_directives(vec![directive(2)]);
        let original = MessageCodec::encode(&second[0]).unwrap();
        // Lost in transit.

        p.clock.advance(19_999);
        assert!(p.a.due_retransmissions().is_empty());
        p.clock.advance(1);
        let resent = p.a.due_retransmissions();
        assert_eq!(resent.len(), 1);
        assert_eq!(MessageCodec::encode(&resent[0]).unwrap(), original);

        assert_eq!(
            p.b.receive_directive_message(as_directive(&resent[0])),
            ReceiveStatus::Ok
        );
    }

    #[test]
    fn test_retransmission_backoff_schedule() {
        let p = pair();
        p.a.send_directives(vec![directive(1)]);
        let mut resend_times = Vec::new();
        for _ in 0..700 {
            p.clock.advance(1_000);
            if !p.a.due_retransmissions().is_empty() {
                resend_times.push(p.clock.now_millis() / 1_000);
            }
        }
        assert_eq!(resend_times[..5], [20, 40, 100, 220, 520]);
    }

    #[test]
    fn test_restart_detected_and_signalled() {
        let p = pair();
        // b (incarnation 1500) talks to a first.
        let from_b = p.b.send_directives(vec![Directive::new("b", "a", "t", serde_json::Value::Null)]);
        assert_eq!(p.a.receive_directive_message(as_directive(&from_b[0])), ReceiveStatus::Ok);
        p.a.send_directives(vec![directive(1)]);

        // b restarts with a fresh incarnation.
        let reborn = MessageManager::with_incarnation("b", MessagingConfig::default(), p.clock.clone(), 2_000);
        let hello = reborn.send_directives(vec![Directive::new("b", "a", "t", serde_json::Value::Null)]);
        assert_eq!(as_directive(&hello[0]).contents_id, 1);

        let status = p.a.receive_directive_message(as_directive(&hello[0]));
        assert_eq!(status, ReceiveStatus::Restart { accepted: true });

        let conn = p.a.connection(&"b".into()).unwrap();
        assert_eq!(conn.remote_incarnation, 2_000);
        assert_eq!(conn.local_incarnation, 1_000);
        assert!(conn.outstanding.is_empty());
        assert_eq!(conn.receive_sequence, 1);

        // Old incarnation traffic is now stale.
        assert_eq!(p.a.receive_directive_message(as_directive(&from_b[0])), ReceiveStatus::Stale);
    }

    #[test]
    fn test_future_with_all_acked_triggers_desync() {
        let p = pair();
        let from_b = p.b.send_directives(vec![Directive::new("b", "a", "t", serde_json::Value::Null)]);
        p.a.receive_directive_message(as_directive(&from_b[0]));
        let mut msgs = p.a.send_directives(vec![directive(1)]);
        p.b.receive_directive_message(as_directive(&msgs[0]));

        let mut gap = as_directive(&p.a.send_directives(vec![directive(2)])[0]).clone();
        gap.contents_id = 5;
        assert_eq!(p.b.receive_directive_message(&gap), ReceiveStatus::Future);

        gap.all_acked = true;
        p.clock.set(9_000);
        assert_eq!(p.b.receive_directive_message(&gap), ReceiveStatus::Desync);
        // A second gap while the resync is pending is just dropped.
        assert_eq!(p.b.receive_directive_message(&gap), ReceiveStatus::Future);

        let handshake = p.b.due_retransmissions();
        let handshake = as_directive(&handshake[0]);
        assert_eq!(handshake.contents_id, 1);
        assert_eq!(handshake.incarnation, 9_000);
        assert!(handshake.is_keep_alive());

        // a sees b restart and follows.
        assert_eq!(
            p.a.receive_directive_message(handshake),
            ReceiveStatus::Restart { accepted: true }
        );
        msgs = p.a.send_directives(vec![directive(3)]);
        assert_eq!(as_directive(&msgs[0]).contents_id, 1);
        assert_eq!(p.b.receive_directive_message(as_directive(&msgs[0])), ReceiveStatus::Ok);
        assert!(!p.b.connection(&"a".into()).unwrap().resync_pending);
    }

    #[test]
    fn test_reordered_first_contact_is_future() {
        let p = pair();
        let first = p.a.send_directives(vec![directive(1)]);
        let second = p.a.send_directives(vec![directive(2)]);
        assert!(!as_directive(&second[0]).all_acked);

        assert_eq!(
            p.b.receive_directive_message(as_directive(&second[0])),
            ReceiveStatus::Future
        );
        let conn = p.b.connection(&"a".into()).unwrap();
        assert_eq!(conn.local_incarnation, 1_500);
        assert!(!conn.resync_pending);
        assert!(p.b.due_retransmissions().is_empty());

        assert_eq!(p.b.receive_directive_message(as_directive(&first[0])), ReceiveStatus::Ok);
        assert_eq!(p.b.receive_directive_message(as_directive(&second[0])), ReceiveStatus::Ok);
        assert_eq!(p.b.incarnation(), 1_500);
    }

    #[test]
    fn test_held_sends_released_by_covering_snapshot_only() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let a = MessageManager::with_incarnation("a", MessagingConfig::default(), clock.clone(), 1_000)
            .holding_sends(true);
        assert!(a.send_directives(vec![directive(1)]).is_empty());
        assert!(a.has_held_sends());
        clock.advance(60_000);
        assert!(a.due_retransmissions().is_empty());

        let covered = a.snapshot();
        assert!(a.send_directives(vec![directive(2)]).is_empty());
        let released = a.commit_sends(&covered);
        assert_eq!(released.len(), 1);
        assert_eq!(as_directive(&released[0]).contents_id, 1);
        assert!(a.has_held_sends());

        let released = a.commit_sends(&a.snapshot());
        assert_eq!(as_directive(&released[0]).contents_id, 2);
        assert!(!a.has_held_sends());
    }

    #[test]
    fn test_keep_alive_after_idle() {
        let p = pair();
        let sent = p.a.send_directives(vec![directive(1)]);
        p.b.receive_directive_message(as_directive(&sent[0]));
        p.b.commit_acks();
        p.a.receive_ack(as_ack(&p.b.take_due_acks()[0]));

        p.clock.advance(54_999);
        assert!(p.a.due_keep_alives().is_empty());
        p.clock.advance(1);
        let ka = p.a.due_keep_alives();
        let ka = as_directive(&ka[0]);
        assert!(ka.is_keep_alive());
        assert_eq!(ka.contents_id, 2);
        assert!(p.a.due_keep_alives().is_empty());
    }

    #[test]
    fn test_snapshot_restore_keeps_incarnation() {
        let p = pair();
        p.a.send_directives(vec![directive(1)]);
        let snapshot = p.a.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let resumed = MessageManager::new("a", MessagingConfig::default(), p.clock.clone());
        resumed.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(resumed.incarnation(), 1_000);
        // Outstanding work resumes immediately.
        assert_eq!(resumed.due_retransmissions().len(), 1);
        let next = resumed.send_directives(vec![directive(2)]);
        assert_eq!(as_directive(&next[0]).contents_id, 2);
    }
}
