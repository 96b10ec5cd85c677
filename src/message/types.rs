//! Wire-level message types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of an agent on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A domain message from one agent to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: Uuid,
    pub source: PeerId,
    pub destination: PeerId,
    pub kind: String,
    pub payload: Value,
}

impl Directive {
    pub fn new(
        source: impl Into<PeerId>,
        destination: impl Into<PeerId>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// A sequenced batch of directives for one peer.
///
/// A message with no directives is a keep-alive (or, with `contents_id`
/// 1, the handshake of a fresh incarnation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveMessage {
    pub source: PeerId,
    pub destination: PeerId,
    /// Sender's incarnation for this connection.
    pub incarnation: i64,
    /// Sequence number; 1 is the first message of an incarnation.
    pub contents_id: i32,
    pub directives: Vec<Directive>,
    /// The sender had nothing unacknowledged when this was first sent.
    pub all_acked: bool,
}

impl DirectiveMessage {
    pub fn is_keep_alive(&self) -> bool {
        self.directives.is_empty()
    }
}

/// Acknowledgement of everything up to `ack_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub source: PeerId,
    pub destination: PeerId,
    /// Acknowledger's own incarnation.
    pub incarnation: i64,
    /// Incarnation of the sender being acknowledged.
    pub acked_incarnation: i64,
    /// Highest contiguous sequence durably processed.
    pub ack_number: i32,
}

/// Anything a transport carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Directive(DirectiveMessage),
    Ack(AckMessage),
}

impl Message {
    pub fn source(&self) -> &PeerId {
        match self {
            Self::Directive(m) => &m.source,
            Self::Ack(m) => &m.source,
        }
    }

    pub fn destination(&self) -> &PeerId {
        match self {
            Self::Directive(m) => &m.destination,
            Self::Ack(m) => &m.destination,
        }
    }
}

/// Receive-side classification of a directive message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// Next in sequence; deliver.
    Ok,
    /// Already seen; re-acknowledge and drop.
    Duplicate,
    /// Gap in the sequence; drop and wait for retransmission.
    Future,
    /// From an incarnation older than the one on record; drop.
    Stale,
    /// The sender restarted. `accepted` is true when this message opens the
    /// new incarnation and may be delivered.
    Restart { accepted: bool },
    /// The connection lost sync and was reset locally; drop.
    Desync,
}

impl ReceiveStatus {
    /// True if the directives should be handed to message providers.
    pub fn deliverable(self) -> bool {
        matches!(self, Self::Ok | Self::Restart { accepted: true })
    }
}
