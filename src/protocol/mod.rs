//! Protocol module
//!
//! This module defines the mesh wire format. Every frame exchanged between two
//! linked devices is one Protocol Buffer encoded [`MeshMessage`]; control
//! messages carry a second, type-specific Protocol Buffer in `content`
//! (see [`payloads`]).
//!
//! The message structs are declared with `prost` derives directly rather than
//! generated from `.proto` files, so the crate builds without `protoc`.

mod ids;
pub mod payloads;

pub use ids::{unix_millis, MessageId, NodeId, PeerHandle, StampClock};
pub use payloads::{
    decode_payload, encode_payload, HeartbeatPayload, NodeAnnouncement, RouteReplyPayload,
    RouteRequestPayload, TopologyAdvertisement,
};

use crate::error::ProtocolError;
use prost::Message;

/// Maximum frame size (64 KB)
///
/// Short-range links carry small frames; anything larger is treated as
/// malformed input.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound any `hop_count` or `max_hops` may take
pub const MAX_HOP_LIMIT: u32 = 32;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Kind of mesh message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Never valid on the wire
    Unspecified = 0,
    /// Application chat text
    Chat = 1,
    /// Unsolicited presence announcement
    Discovery = 2,
    /// Adjacency advertisement or advertisement request
    Topology = 3,
    /// Flooded route query
    RouteRequest = 4,
    /// Route answer travelling back to the requester
    RouteReply = 5,
    /// Periodic liveness probe
    Heartbeat = 6,
}

impl MessageType {
    /// Whether this type carries application data
    pub fn is_chat(&self) -> bool {
        matches!(self, Self::Chat)
    }
}

/// One frame on a mesh link
#[derive(Clone, PartialEq, Message)]
pub struct MeshMessage {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Unique per originating node
    #[prost(bytes = "vec", tag = "2")]
    pub message_id: Vec<u8>,
    /// See [`MessageType`]
    #[prost(enumeration = "MessageType", tag = "3")]
    pub message_type: i32,
    /// Originating node
    #[prost(string, tag = "4")]
    pub source_node_id: String,
    /// Destination node; absent for broadcast
    #[prost(string, optional, tag = "5")]
    pub target_node_id: Option<String>,
    /// Chat bytes or an encoded control payload
    #[prost(bytes = "vec", tag = "6")]
    pub content: Vec<u8>,
    /// Origin wall clock in milliseconds
    #[prost(uint64, tag = "7")]
    pub timestamp: u64,
    /// Number of links this copy has crossed
    #[prost(uint32, tag = "8")]
    pub hop_count: u32,
    /// Display name of the last transmitting node
    #[prost(string, tag = "9")]
    pub sender_name: String,
    /// Link address of the last transmitting node
    #[prost(string, tag = "10")]
    pub sender_address: String,
}

impl MeshMessage {
    /// Create a message at the origin with `hop_count = 0`
    pub fn new(
        message_id: MessageId,
        message_type: MessageType,
        source: &NodeId,
        target: Option<&NodeId>,
        content: Vec<u8>,
        timestamp: u64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id: message_id.as_bytes().to_vec(),
            message_type: message_type.into(),
            source_node_id: source.as_str().to_string(),
            target_node_id: target.map(|t| t.as_str().to_string()),
            content,
            timestamp,
            hop_count: 0,
            sender_name: String::new(),
            sender_address: String::new(),
        }
    }

    /// Parsed message ID, if the field has the right length
    pub fn id(&self) -> Option<MessageId> {
        MessageId::from_slice(&self.message_id)
    }

    /// Originating node
    pub fn source(&self) -> NodeId {
        NodeId::new(self.source_node_id.clone())
    }

    /// Destination node, `None` for broadcast
    pub fn target(&self) -> Option<NodeId> {
        self.target_node_id.as_deref().map(NodeId::from)
    }

    /// True when the message has no destination
    pub fn is_broadcast(&self) -> bool {
        self.target_node_id.is_none()
    }
}

/// Serialize a message to a frame
pub fn encode_frame(message: &MeshMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).map_err(|e| ProtocolError::EncodeFailed {
        reason: format!("prost encode error: {}", e),
    })?;

    if buf.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(buf)
}

/// Deserialize and validate a frame received from a link
pub fn decode_frame(bytes: &[u8]) -> Result<MeshMessage, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let message = MeshMessage::decode(bytes).map_err(|e| ProtocolError::MalformedFrame {
        reason: format!("prost decode error: {}", e),
    })?;

    validate_message(&message)?;
    Ok(message)
}

/// Validate the header fields of a received message
///
/// Every frame on the wire has been transmitted at least once, so a valid
/// `hop_count` is in `1..=MAX_HOP_LIMIT`.
pub fn validate_message(message: &MeshMessage) -> Result<(), ProtocolError> {
    if message.version != PROTOCOL_VERSION {
        return Err(ProtocolError::MalformedFrame {
            reason: format!("unsupported protocol version {}", message.version),
        });
    }

    if message.message_id.len() != MessageId::LEN {
        return Err(ProtocolError::MalformedFrame {
            reason: format!(
                "message_id must be {} bytes, got {}",
                MessageId::LEN,
                message.message_id.len()
            ),
        });
    }

    match MessageType::try_from(message.message_type) {
        Ok(MessageType::Unspecified) | Err(_) => {
            return Err(ProtocolError::UnknownMessageType(message.message_type));
        },
        Ok(_) => {},
    }

    if message.source_node_id.is_empty() {
        return Err(ProtocolError::MissingField {
            field: "source_node_id",
        });
    }

    if matches!(message.target_node_id.as_deref(), Some("")) {
        return Err(ProtocolError::MissingField {
            field: "target_node_id",
        });
    }

    if message.hop_count == 0 || message.hop_count > MAX_HOP_LIMIT {
        return Err(ProtocolError::MalformedFrame {
            reason: format!("hop_count {} out of range", message.hop_count),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(target: Option<&str>) -> MeshMessage {
        let source = NodeId::new("A");
        let target = target.map(NodeId::new);
        let mut msg = MeshMessage::new(
            MessageId::generate(&source, 1, 1000),
            MessageType::Chat,
            &source,
            target.as_ref(),
            b"hello".to_vec(),
            1000,
        );
        msg.hop_count = 1;
        msg
    }

    #[test]
    fn test_broadcast_target_survives_encoding() {
        let frame = encode_frame(&sample(None)).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.is_broadcast());
        assert_eq!(decoded.target(), None);
    }

    #[test]
    fn test_targeted_message_decodes() {
        let frame = encode_frame(&sample(Some("C"))).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.target(), Some(NodeId::new("C")));
        assert_eq!(decoded.message_type(), MessageType::Chat);
        assert_eq!(decoded.content, b"hello");
    }

    #[test]
    fn test_garbage_is_malformed() {
        let result = decode_frame(&[0xff, 0xff, 0xff, 0x01, 0x02]);
        assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    }

    #[test]
    fn test_empty_frame_rejected() {
        // Empty bytes decode to all-default fields, which fail validation
        assert!(decode_frame(&[]).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let bytes = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut msg = sample(None);
        msg.message_type = 99;
        assert_eq!(
            validate_message(&msg),
            Err(ProtocolError::UnknownMessageType(99))
        );
    }

    #[test]
    fn test_empty_target_rejected() {
        let mut msg = sample(None);
        msg.target_node_id = Some(String::new());
        assert!(matches!(
            validate_message(&msg),
            Err(ProtocolError::MissingField {
                field: "target_node_id"
            })
        ));
    }

    #[test]
    fn test_zero_hop_count_rejected() {
        let mut msg = sample(None);
        msg.hop_count = 0;
        assert!(validate_message(&msg).is_err());
    }
}
