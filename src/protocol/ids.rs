//! Identifier types shared by every layer of the mesh
//!
//! Node identifiers form a flat, totally ordered namespace. The ordering is
//! what makes route selection deterministic when several equal-length paths
//! exist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier of a mesh node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier from a link address
    ///
    /// The format is `<address without colons>_<unix millis>_<random hex>`,
    /// e.g. `A4C1380F22B1_1718000000000_9f2c`.
    pub fn generate(link_address: &str) -> Self {
        let suffix: u16 = rand::random();
        Self(format!(
            "{}_{}_{:04x}",
            link_address.replace(':', ""),
            unix_millis(),
            suffix
        ))
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty identifier, which is never valid on the wire
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for a message
///
/// A Blake3 hash over the originating node, a per-node sequence number and
/// the creation time. Uniqueness only matters per origin: duplicate
/// suppression keys on `(MessageId, source NodeId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 32]);

impl MessageId {
    /// Length of the identifier on the wire
    pub const LEN: usize = 32;

    /// Derive a new message ID for `origin`
    pub fn generate(origin: &NodeId, sequence: u64, timestamp: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update(&sequence.to_le_bytes());
        hasher.update(&timestamp.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a message ID from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a message ID from a wire slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this message ID
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get a hexadecimal string representation
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Opaque handle the transport uses for one point-to-point link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u64);

impl PeerHandle {
    /// Wrap a transport-assigned link number
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The transport-assigned link number
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Wall-clock stamps that never repeat or go backwards for one origin
///
/// Topology advertisements and heartbeats use these stamps for
/// last-writer-wins merging, so two messages created in the same
/// millisecond must still be ordered.
#[derive(Debug, Default)]
pub struct StampClock {
    last: u64,
}

impl StampClock {
    /// Create a clock that has issued nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Next strictly increasing stamp
    pub fn next_stamp(&mut self) -> u64 {
        let now = unix_millis();
        self.last = now.max(self.last + 1);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation_strips_colons() {
        let id = NodeId::generate("A4:C1:38:0F:22:B1");
        assert!(id.as_str().starts_with("A4C1380F22B1_"));
        assert!(!id.as_str().contains(':'));
    }

    #[test]
    fn test_node_id_ordering() {
        assert!(NodeId::new("A") < NodeId::new("B"));
        assert!(NodeId::new("B") < NodeId::new("BA"));
    }

    #[test]
    fn test_message_id_unique_per_sequence() {
        let origin = NodeId::new("A");
        let id1 = MessageId::generate(&origin, 1, 100);
        let id2 = MessageId::generate(&origin, 2, 100);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_message_id_from_slice() {
        let id = MessageId::generate(&NodeId::new("A"), 7, 1);
        assert_eq!(MessageId::from_slice(id.as_bytes()), Some(id));
        assert_eq!(MessageId::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_message_id_hex() {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        let id = MessageId::from_bytes(bytes);
        assert!(id.to_hex().starts_with("12345678"));
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn test_stamp_clock_strictly_increases() {
        let mut clock = StampClock::new();
        let a = clock.next_stamp();
        let b = clock.next_stamp();
        let c = clock.next_stamp();
        assert!(a < b && b < c);
    }
}
