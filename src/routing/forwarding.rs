//! Message forwarding logic for multi-hop routing
//!
//! This module handles the per-frame decisions of the router: where a
//! received message belongs, whether it may travel another hop, and how a
//! copy is stamped before it goes onto a link.

use crate::error::RoutingError;
use crate::protocol::{MeshMessage, NodeId};

/// Identity the local node stamps on every transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Local node ID
    pub node_id: NodeId,
    /// Local display name
    pub device_name: String,
    /// Local link address
    pub link_address: String,
}

/// Where a received message belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Addressed to the local node
    Local,
    /// Broadcast: handle locally, then relay to everyone else
    Broadcast,
    /// Addressed to another node: relay toward it
    Relay(NodeId),
}

/// Decide where a received message belongs
pub fn classify(message: &MeshMessage, local: &NodeId) -> Disposition {
    match message.target() {
        None => Disposition::Broadcast,
        Some(target) if target == *local => Disposition::Local,
        Some(target) => Disposition::Relay(target),
    }
}

/// Check if a message may be transmitted one more time
///
/// A copy carrying `hop_count == max_hops` has already crossed the maximum
/// number of links and is never relayed.
pub fn should_forward_message(message: &MeshMessage, max_hops: u32) -> bool {
    message.hop_count < max_hops
}

/// Increment the hop count of a message
pub fn increment_hop_count(message: &mut MeshMessage) {
    message.hop_count = message.hop_count.saturating_add(1);
}

/// Prepare a copy for transmission
///
/// Increments the hop count and replaces the sender metadata with the local
/// identity.
///
/// # Errors
///
/// Returns [`RoutingError::HopLimitExceeded`] if the message already
/// carries `max_hops`.
pub fn stamp_for_transmit(
    message: &mut MeshMessage,
    local: &LocalIdentity,
    max_hops: u32,
) -> Result<(), RoutingError> {
    if !should_forward_message(message, max_hops) {
        return Err(RoutingError::HopLimitExceeded {
            hop_count: message.hop_count,
            max_hops,
        });
    }
    increment_hop_count(message);
    message.sender_name = local.device_name.clone();
    message.sender_address = local.link_address.clone();
    Ok(())
}

/// Check that a route path is loop-free
pub fn is_loop_free(path: &[NodeId]) -> bool {
    let mut seen = std::collections::HashSet::with_capacity(path.len());
    path.iter().all(|node| seen.insert(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageId, MessageType};

    fn identity() -> LocalIdentity {
        LocalIdentity {
            node_id: NodeId::new("B"),
            device_name: "Relay".to_string(),
            link_address: "00:11".to_string(),
        }
    }

    fn message(target: Option<&str>, hop_count: u32) -> MeshMessage {
        let source = NodeId::new("A");
        let target = target.map(NodeId::new);
        let mut msg = MeshMessage::new(
            MessageId::generate(&source, 1, 0),
            MessageType::Chat,
            &source,
            target.as_ref(),
            b"hi".to_vec(),
            0,
        );
        msg.hop_count = hop_count;
        msg
    }

    #[test]
    fn test_classify() {
        let local = NodeId::new("B");
        assert_eq!(classify(&message(None, 1), &local), Disposition::Broadcast);
        assert_eq!(classify(&message(Some("B"), 1), &local), Disposition::Local);
        assert_eq!(
            classify(&message(Some("C"), 1), &local),
            Disposition::Relay(NodeId::new("C"))
        );
    }

    #[test]
    fn test_stamp_increments_and_sets_sender() {
        let mut msg = message(Some("C"), 1);
        stamp_for_transmit(&mut msg, &identity(), 10).unwrap();

        assert_eq!(msg.hop_count, 2);
        assert_eq!(msg.sender_name, "Relay");
        assert_eq!(msg.sender_address, "00:11");
        assert_eq!(msg.source_node_id, "A");
    }

    #[test]
    fn test_max_hops_never_relayed() {
        let mut msg = message(None, 3);
        assert!(!should_forward_message(&msg, 3));

        let err = stamp_for_transmit(&mut msg, &identity(), 3).unwrap_err();
        assert_eq!(
            err,
            RoutingError::HopLimitExceeded {
                hop_count: 3,
                max_hops: 3
            }
        );
        assert_eq!(msg.hop_count, 3);
    }

    #[test]
    fn test_origin_transmission_starts_at_one() {
        let mut msg = message(None, 0);
        stamp_for_transmit(&mut msg, &identity(), 1).unwrap();
        assert_eq!(msg.hop_count, 1);
    }

    #[test]
    fn test_loop_free_path() {
        let path: Vec<NodeId> = ["A", "B", "C"].iter().map(|s| NodeId::new(*s)).collect();
        assert!(is_loop_free(&path));

        let looped: Vec<NodeId> = ["A", "B", "A"].iter().map(|s| NodeId::new(*s)).collect();
        assert!(!is_loop_free(&looped));
    }
}
