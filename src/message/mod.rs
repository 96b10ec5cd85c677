//! Reliable directive messaging between agents.
//!
//! Layering, bottom up:
//!
//! - [`types`]: wire messages, i.e. sequenced [`DirectiveMessage`]s and
//!   [`AckMessage`]s.
//! - [`AckSet`]: which received sequences have been processed.
//! - [`PeerConnection`]: per-peer sequencing, acks and outstanding
//!   messages within one incarnation.
//! - [`MessageManager`]: the protocol itself, covering classification, retransmission,
//!   keep-alives, durability-gated acks, restart and desync recovery.
//! - [`workers`]: background threads driving the manager.
//! - [`MessageTransport`] / [`MessageCodec`]: the wire.
//!
//! Delivery on the wire is at-least-once; delivery to message providers is
//! exactly-once per sequence number within an incarnation.

pub mod ack_set;
pub mod codec;
pub mod connection;
pub mod manager;
pub mod transport;
pub mod types;
pub mod workers;

pub use ack_set::AckSet;
pub use codec::MessageCodec;
pub use connection::{PeerConnection, TimestampedMessage};
pub use manager::{MessageManager, MessageManagerState};
pub use transport::{ChannelTransport, MessageTransport, PeerReceiver};
pub use types::{AckMessage, Directive, DirectiveMessage, Message, PeerId, ReceiveStatus};
