//! # meshroute
//!
//! A peer-to-peer mesh routing and forwarding engine for devices linked
//! pairwise over a short-range radio. Nodes discover each other, share
//! topology, compute shortest-hop routes and relay messages for one another
//! without a central coordinator.
//!
//! The radio itself stays outside the crate: an application supplies a
//! [`transport::Transport`] for outgoing frames and reports link activity
//! through a [`transport::LinkSender`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshroute::{MeshNodeBuilder, MemoryNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let alice = network
//!         .spawn_node(MeshNodeBuilder::new().with_node_id("alice"))
//!         .await?;
//!     let bob = network
//!         .spawn_node(MeshNodeBuilder::new().with_node_id("bob"))
//!         .await?;
//!     network.connect(alice.node_id(), bob.node_id())?;
//!
//!     alice.send_chat_message(Some(bob.node_id()), "hi bob").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod error;
pub mod protocol;
pub mod routing;
pub mod transport;

// Re-export main types
pub use api::{
    Event, MeshConfig, MeshNode, MeshNodeBuilder, MeshSnapshot, NetworkProfile, NodeState,
    SubscriptionHandle,
};
pub use error::{
    ConfigError, MeshError, ProtocolError, Result, RoutingError, TransportError,
};
pub use protocol::{MessageId, NodeId, PeerHandle};
pub use routing::{DiscoveryState, NodeRecord, NodeStatus, Route, SendOutcome};
pub use transport::memory::MemoryNetwork;
pub use transport::{ConnectionState, LinkEvent, LinkSender, Transport};
