//! Control payloads carried in `MeshMessage::content`

use crate::error::ProtocolError;
use crate::protocol::{MessageType, NodeId};
use prost::Message;

/// Presence announcement (`Discovery`)
///
/// Sent to a freshly connected peer and flooded when the node starts.
#[derive(Clone, PartialEq, Message)]
pub struct NodeAnnouncement {
    /// Display name of the announcing device
    #[prost(string, tag = "1")]
    pub device_name: String,
    /// Link address of the announcing device
    #[prost(string, tag = "2")]
    pub link_address: String,
    /// Nodes the announcer is directly linked to
    #[prost(string, repeated, tag = "3")]
    pub neighbors: Vec<String>,
}

/// Adjacency advertisement (`Topology`)
///
/// With `request` set the message is a targeted query asking the target to
/// flood a fresh advertisement of its own.
#[derive(Clone, PartialEq, Message)]
pub struct TopologyAdvertisement {
    /// Nodes the advertiser is directly linked to
    #[prost(string, repeated, tag = "1")]
    pub neighbors: Vec<String>,
    /// Ask the target to advertise instead
    #[prost(bool, tag = "2")]
    pub request: bool,
}

/// Flooded route query (`RouteRequest`)
#[derive(Clone, PartialEq, Message)]
pub struct RouteRequestPayload {
    /// Identifier chosen by the requester
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Node the requester wants a route to
    #[prost(string, tag = "2")]
    pub target_node_id: String,
    /// Nodes traversed so far, requester first
    #[prost(string, repeated, tag = "3")]
    pub path: Vec<String>,
}

/// Route answer (`RouteReply`), routed back to the requester
#[derive(Clone, PartialEq, Message)]
pub struct RouteReplyPayload {
    /// Identifier copied from the request
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Node the route resolves
    #[prost(string, tag = "2")]
    pub target_node_id: String,
    /// Full path from the requester to the target, both inclusive
    #[prost(string, repeated, tag = "3")]
    pub path: Vec<String>,
}

/// Liveness probe (`Heartbeat`)
#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatPayload {
    /// Display name of the announcing device
    #[prost(string, tag = "1")]
    pub device_name: String,
    /// Link address of the announcing device
    #[prost(string, tag = "2")]
    pub link_address: String,
}

/// Encode a control payload into message content
pub fn encode_payload<T: Message>(payload: &T) -> Vec<u8> {
    payload.encode_to_vec()
}

/// Decode a control payload, tagging failures with the message type
pub fn decode_payload<T: Message + Default>(
    message_type: MessageType,
    content: &[u8],
) -> Result<T, ProtocolError> {
    T::decode(content).map_err(|e| ProtocolError::InvalidPayload {
        message_type,
        reason: e.to_string(),
    })
}

/// Convert wire identifiers into node IDs, dropping empty entries
pub fn node_ids(raw: &[String]) -> Vec<NodeId> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .map(|s| NodeId::new(s.clone()))
        .collect()
}

/// Convert node IDs into wire identifiers
pub fn wire_ids<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<String> {
    ids.into_iter().map(|id| id.as_str().to_string()).collect()
}
