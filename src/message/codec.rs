//! JSON wire codec.

use bytes::Bytes;

use super::types::Message;
use crate::errors::TransportError;

/// Encodes [`Message`]s to bytes and back.
///
/// Encoding is deterministic, so a retransmitted message produces the same
/// bytes as its first transmission.
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(message: &Message) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Directive, DirectiveMessage};

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            MessageCodec::decode(b"{not json"),
            Err(TransportError::Codec(_))
        ));
    }

    #[test]
    fn test_directive_message_survives_the_wire() {
        let message = Message::Directive(DirectiveMessage {
            source: "a".into(),
            destination: "b".into(),
            incarnation: 1_000,
            contents_id: 2,
            directives: vec![Directive::new("a", "b", "task", serde_json::json!({"z": 1, "a": [1, 2]}))],
            all_acked: false,
        });
        let bytes = MessageCodec::encode(&message).unwrap();
        assert_eq!(MessageCodec::decode(&bytes).unwrap(), message);
        assert_eq!(MessageCodec::encode(&message).unwrap(), bytes);
    }
}
