//! Routing subsystem for the mesh
//!
//! This module turns link activity into routes and moves messages along
//! them, including:
//! - Node bookkeeping with liveness and reachability
//! - Topology aggregation from direct links, advertisements and discovered paths
//! - Shortest-hop route computation
//! - On-demand route discovery for unknown targets
//! - Flooding of broadcasts with duplicate suppression and hop limits
//! - Heartbeat-driven timeout and eviction
//!
//! # Architecture
//!
//! The routing system consists of several components:
//!
//! - **NodeRegistry**: Authoritative view of every known node
//! - **TopologyStore**: Who is linked to whom
//! - **RouteTable**: Breadth-first shortest paths, recomputed lazily
//! - **Discovery**: Route-request/route-reply state machine
//! - **HeartbeatMonitor**: Liveness sweep and eviction
//! - **Router**: The task that owns all of the above and drives it
//!
//! # Message Deduplication
//!
//! Every received frame is checked against a time-windowed cache of
//! `(message_id, source)` pairs. A duplicate is dropped before it is handled
//! or relayed, so a flood crosses each link at most once per direction.
//!
//! # Hop Counting
//!
//! `hop_count` is the number of links a copy has crossed. The origin creates
//! a message with 0 and every transmission adds one, so a frame that arrives
//! with 1 came straight from its origin. A copy carrying `max_hops` is never
//! transmitted again.
//!
//! # Route Discovery
//!
//! Routes are learned through:
//! 1. Direct links reported by the transport
//! 2. Presence announcements and topology advertisements
//! 3. Paths carried by route requests and replies
//!
//! A send to a node with no route floods a route request and waits, with
//! a timeout, until one of these sources makes the target reachable.

mod dedup;
mod discovery;
mod forwarding;
mod heartbeat;
mod node_registry;
mod router;
mod routing_table;
mod topology;

// Public exports
pub use dedup::{MessageKey, SeenCache};
pub use discovery::{DiscoveryState, PendingRequest, QueuedMessage};
pub use forwarding::{
    classify, increment_hop_count, is_loop_free, should_forward_message, stamp_for_transmit,
    Disposition, LocalIdentity,
};
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use node_registry::{
    NodeRecord, NodeRegistry, NodeStatus, Observation, ObservationKind, StatusChange,
    UpsertOutcome,
};
pub use router::SendOutcome;
pub use routing_table::{Route, RouteCache, RouteTable};
pub use topology::TopologyStore;

pub(crate) use router::{Command, MeshRouter};
