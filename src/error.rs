//! Error types for meshroute

use crate::protocol::{MessageType, NodeId, PeerHandle};
use thiserror::Error;

/// Main error type for meshroute operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// Wire protocol errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Routing errors
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The node has not been started, or was stopped
    #[error("Mesh node is not running")]
    NotRunning,

    /// `start` was called on a running node
    #[error("Mesh node is already running")]
    AlreadyRunning,

    /// The router task went away while a request was in flight
    #[error("Mesh router has shut down")]
    EngineStopped,
}

/// Errors raised while decoding or validating frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame could not be decoded
    #[error("Malformed frame: {reason}")]
    MalformedFrame {
        /// Decoder or validation message
        reason: String,
    },

    /// Frame exceeds the maximum size
    #[error("Frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge {
        /// Actual size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Message type tag is not known
    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    /// A required field is empty
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field name
        field: &'static str,
    },

    /// Control payload did not decode for its message type
    #[error("Invalid {message_type:?} payload: {reason}")]
    InvalidPayload {
        /// Message type the payload belongs to
        message_type: MessageType,
        /// Decoder message
        reason: String,
    },

    /// Message could not be encoded
    #[error("Failed to encode message: {reason}")]
    EncodeFailed {
        /// Encoder message
        reason: String,
    },
}

/// Errors raised by routing decisions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No path to the target, even after discovery
    #[error("No route to node {target}")]
    NoRoute {
        /// Target that could not be resolved
        target: NodeId,
    },

    /// Relay would push the hop count past the limit
    #[error("Hop limit exceeded: hop count {hop_count}, max {max_hops}")]
    HopLimitExceeded {
        /// Hop count carried by the message
        hop_count: u32,
        /// Configured maximum
        max_hops: u32,
    },

    /// Message was already seen
    #[error("Duplicate message")]
    DuplicateMessage,

    /// Node stopped answering heartbeats
    #[error("Peer {node_id} is unreachable")]
    PeerUnreachable {
        /// The silent node
        node_id: NodeId,
    },

    /// A message cannot be addressed to the local node
    #[error("Cannot route a message to the local node")]
    SelfTarget,
}

/// Errors reported by the underlying link transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer handle is not (or no longer) connected
    #[error("Peer not connected: {peer}")]
    PeerNotConnected {
        /// Handle of the missing peer
        peer: PeerHandle,
    },

    /// Writing the frame failed
    #[error("Send to {peer} failed: {reason}")]
    SendFailed {
        /// Destination peer
        peer: PeerHandle,
        /// Transport message
        reason: String,
    },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Reading or writing the configuration file failed
    #[error("Config I/O error at {path}: {reason}")]
    Io {
        /// File path
        path: String,
        /// OS message
        reason: String,
    },

    /// JSON could not be parsed or produced
    #[error("Config serialization error: {reason}")]
    Serialization {
        /// serde_json message
        reason: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_route_display() {
        let err: MeshError = RoutingError::NoRoute {
            target: NodeId::new("C"),
        }
        .into();
        assert_eq!(err.to_string(), "No route to node C");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: MeshError = ProtocolError::MissingField { field: "message_id" }.into();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MissingField { .. })
        ));
    }
}
