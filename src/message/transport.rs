//! Transport boundary.
//!
//! The core only needs an unordered, lossy `send`. Receiving is the
//! embedder's business: whatever arrives is handed to
//! [`Distributor::receive_messages`](crate::distributor::Distributor::receive_messages).

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};

use bytes::Bytes;
use parking_lot::Mutex;

use super::codec::MessageCodec;
use super::types::{Message, PeerId};
use crate::errors::TransportError;

/// Outbound message primitive. May drop, duplicate or reorder.
pub trait MessageTransport: Send + Sync {
    fn send(&self, message: Message) -> Result<(), TransportError>;
}

type LossFilter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// In-process transport over `std::sync::mpsc` channels carrying encoded
/// bytes, one receiver per registered peer.
///
/// An optional loss filter drops every message it returns true for, to
/// exercise retransmission.
#[derive(Default)]
pub struct ChannelTransport {
    routes: Mutex<HashMap<PeerId, Sender<Bytes>>>,
    loss: Option<LossFilter>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop messages matching `filter`.
    pub fn with_loss(mut self, filter: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        self.loss = Some(Box::new(filter));
        self
    }

    /// Register a peer and get its inbound channel.
    pub fn register(&self, peer: impl Into<PeerId>) -> PeerReceiver {
        let (tx, rx) = mpsc::channel();
        self.routes.lock().insert(peer.into(), tx);
        PeerReceiver { rx }
    }

    /// Forget a peer; later sends to it fail with `NoRoute`.
    pub fn unregister(&self, peer: &PeerId) {
        self.routes.lock().remove(peer);
    }
}

impl MessageTransport for ChannelTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.loss.as_ref().is_some_and(|lose| lose(&message)) {
            log::debug!("ChannelTransport: dropping message to {}", message.destination());
            return Ok(());
        }
        let destination = message.destination().clone();
        let bytes = MessageCodec::encode(&message)?;
        let routes = self.routes.lock();
        let tx = routes
            .get(&destination)
            .ok_or_else(|| TransportError::NoRoute(destination.to_string()))?;
        tx.send(bytes)
            .map_err(|_| TransportError::Disconnected(destination.to_string()))
    }
}

/// Receiving end of one peer's channel.
pub struct PeerReceiver {
    rx: Receiver<Bytes>,
}

impl PeerReceiver {
    /// Everything queued right now. Undecodable frames are logged and skipped.
    pub fn drain(&self) -> Vec<Message> {
        self.rx.try_iter().filter_map(decode_or_log).collect()
    }

    /// Wait up to `timeout` for at least one message, then drain.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Vec<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut out: Vec<Message> = decode_or_log(first).into_iter().collect();
                out.extend(self.drain());
                out
            }
            Err(_) => Vec::new(),
        }
    }
}

fn decode_or_log(bytes: Bytes) -> Option<Message> {
    match MessageCodec::decode(&bytes) {
        Ok(m) => Some(m),
        Err(e) => {
            log::warn!("ChannelTransport: undecodable frame: {}", e);
            None
        }
    }
}
