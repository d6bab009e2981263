//! High-level API for meshroute
//!
//! This module provides the public-facing API that applications use to run
//! a mesh node: building and starting it, sending chat messages, and
//! observing the mesh through events and snapshots.

pub mod config;
pub mod events;
pub mod node;

// Re-export main types for convenience
pub use crate::protocol::{MessageId, NodeId};
pub use config::{load_config, save_config, MeshConfig, NetworkProfile};
pub use events::{Event, EventCallback, EventHandlers, SubscriptionHandle};
pub use node::{MeshNode, MeshNodeBuilder, MeshSnapshot, NodeState};
