//! Per-peer connection state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ack_set::AckSet;
use super::types::{DirectiveMessage, ReceiveStatus};

/// An outgoing message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedMessage {
    pub message: DirectiveMessage,
    /// Real time of the next resend.
    pub next_retry: i64,
    pub retry_count: u32,
    /// Sequenced but not yet covered by a checkpoint, so not yet sent.
    #[serde(default)]
    pub held: bool,
}

/// Sequencing, acknowledgement and retransmission state for one peer in
/// one local incarnation.
///
/// `transmit_sequence` never decreases within a connection; a new
/// connection (fresh incarnation on either side) restarts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConnection {
    pub local_incarnation: i64,
    /// Learned from the peer's first message; 0 until then.
    pub remote_incarnation: i64,
    /// Last sequence assigned to an outgoing message.
    pub transmit_sequence: i32,
    /// Last in-order sequence received.
    pub receive_sequence: i32,
    pub ack_set: AckSet,
    /// Highest sequence covered by a checkpoint, and therefore ackable.
    pub durable_ack: i32,
    /// An ack should go out at the next opportunity.
    pub ack_due: bool,
    /// Unacknowledged outgoing messages, by sequence.
    pub outstanding: BTreeMap<i32, TimestampedMessage>,
    /// Real time of the last transmission to this peer.
    pub last_send: i64,
    /// We reset this connection and are waiting for the peer to follow.
    pub resync_pending: bool,
}

impl PeerConnection {
    pub fn new(local_incarnation: i64, now: i64) -> Self {
        Self {
            local_incarnation,
            remote_incarnation: 0,
            transmit_sequence: 0,
            receive_sequence: 0,
            ack_set: AckSet::new(1),
            durable_ack: 0,
            ack_due: false,
            outstanding: BTreeMap::new(),
            last_send: now,
            resync_pending: false,
        }
    }

    /// Assign the next transmit sequence.
    pub fn next_sequence(&mut self) -> i32 {
        self.transmit_sequence += 1;
        self.transmit_sequence
    }

    /// True if nothing sent is awaiting acknowledgement.
    pub fn all_acked(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Drop every outstanding message with sequence `<= ack_number`.
    pub fn acknowledge(&mut self, ack_number: i32) -> usize {
        let keep = self.outstanding.split_off(&(ack_number.saturating_add(1)));
        let acked = std::mem::replace(&mut self.outstanding, keep);
        acked.len()
    }

    /// Classify an incoming sequence for an incarnation already on record.
    ///
    /// Restart and desync handling need to replace the connection and are
    /// left to the caller; this only returns `Future` for gaps.
    pub fn check_sequence(&mut self, seq: i32) -> ReceiveStatus {
        if seq <= self.receive_sequence {
            self.ack_due = true;
            return ReceiveStatus::Duplicate;
        }
        if seq > self.receive_sequence + 1 {
            return ReceiveStatus::Future;
        }
        self.receive_sequence = seq;
        self.ack_set.set(seq);
        self.resync_pending = false;
        ReceiveStatus::Ok
    }

    /// Received but not yet durable sequences exist.
    pub fn has_uncommitted_acks(&self) -> bool {
        self.ack_set.ack_number() > self.durable_ack
    }

    /// Make everything received so far ackable.
    pub fn commit_acks(&mut self) -> bool {
        let ack = self.ack_set.ack_number();
        if ack > self.durable_ack {
            self.durable_ack = ack;
            self.ack_due = true;
            return true;
        }
        false
    }

    pub fn has_held(&self) -> bool {
        self.outstanding.values().any(|m| m.held)
    }

    /// Earliest retransmission deadline.
    pub fn next_retry(&self) -> Option<i64> {
        self.outstanding
            .values()
            .filter(|m| !m.held)
            .map(|m| m.next_retry)
            .min()
    }
}
