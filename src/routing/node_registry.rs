//! Node registry: the authoritative local view of every known mesh node
//!
//! The registry owns all [`NodeRecord`]s. Other components read through it
//! and request mutations through its methods; nothing else keeps a copy that
//! could drift. Every mutation bumps [`NodeRegistry::generation`], which the
//! route cache compares against to decide when to recompute.

use crate::protocol::NodeId;
use crate::routing::routing_table::RouteTable;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::time::Instant;

/// Believed state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Heard from and routable
    Online,
    /// Direct link closed and no alternate route
    Offline,
    /// Known second-hand, never heard from directly
    Connecting,
    /// Timed out, or its route ran through a dead relay
    Unreachable,
}

/// Identity and liveness record of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Stable identifier
    pub node_id: NodeId,
    /// Display name (not part of identity)
    pub device_name: String,
    /// Transport address (not part of identity)
    pub link_address: String,
    /// First observation
    pub first_seen: Instant,
    /// Latest observation of anything this node originated
    pub last_seen: Instant,
    /// Latest heartbeat received from this node
    pub last_heartbeat: Instant,
    /// Linked to the local node right now
    pub directly_connected: bool,
    /// Hops from the local node; `None` when unknown
    pub hop_distance: Option<u32>,
    /// Direct neighbor on the best known path; unset for direct or unknown
    pub next_hop: Option<NodeId>,
    /// Nodes this node is known to be linked to
    pub connected_nodes: BTreeSet<NodeId>,
    /// Believed state
    pub status: NodeStatus,
    pub(crate) timed_out: bool,
    pub(crate) heartbeat_stamp: u64,
}

impl NodeRecord {
    fn new(node_id: NodeId, observed_at: Instant, status: NodeStatus) -> Self {
        Self {
            node_id,
            device_name: String::new(),
            link_address: String::new(),
            first_seen: observed_at,
            last_seen: observed_at,
            last_heartbeat: observed_at,
            directly_connected: false,
            hop_distance: None,
            next_hop: None,
            connected_nodes: BTreeSet::new(),
            status,
            timed_out: false,
            heartbeat_stamp: 0,
        }
    }

    /// Whether a route to this node is currently known
    pub fn is_reachable(&self) -> bool {
        self.hop_distance.is_some() && self.status != NodeStatus::Unreachable
    }

    /// Whether the node is online
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// Whether heartbeat timeout excluded this node from routing
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Name to show in a node list
    pub fn display_name(&self) -> String {
        if !self.device_name.trim().is_empty() {
            return self.device_name.clone();
        }
        if self.link_address.is_empty() {
            return format!("Unknown Device ({})", self.node_id);
        }
        format!("Unknown Device ({})", self.link_address)
    }

    /// Short reachability summary, e.g. "2 hops away"
    pub fn connection_info(&self) -> String {
        if self.directly_connected {
            return "Direct Connection".to_string();
        }
        match self.hop_distance {
            None => "Unreachable".to_string(),
            Some(1) => "1 hop away".to_string(),
            Some(hops) => format!("{} hops away", hops),
        }
    }
}

/// How a node came to be observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    /// The transport linked us to the node
    DirectLink,
    /// We received something the node originated
    Originated,
    /// Another node named it in an advertisement or route path
    Advertised,
}

/// One observation of a node, merged by [`NodeRegistry::upsert`]
#[derive(Debug, Clone)]
pub struct Observation {
    /// Observed node
    pub node_id: NodeId,
    /// Display name, when the observation carried one
    pub device_name: Option<String>,
    /// Link address, when the observation carried one
    pub link_address: Option<String>,
    /// Local time of the observation
    pub observed_at: Instant,
    /// Confidence of the observation
    pub kind: ObservationKind,
}

impl Observation {
    /// Build an observation without display metadata
    pub fn new(node_id: NodeId, kind: ObservationKind, observed_at: Instant) -> Self {
        Self {
            node_id,
            device_name: None,
            link_address: None,
            observed_at,
            kind,
        }
    }

    /// Attach display metadata; empty strings are ignored
    pub fn with_names(mut self, device_name: &str, link_address: &str) -> Self {
        if !device_name.is_empty() {
            self.device_name = Some(device_name.to_string());
        }
        if !link_address.is_empty() {
            self.link_address = Some(link_address.to_string());
        }
        self
    }
}

/// Result of merging an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was created
    Inserted,
    /// An existing record changed
    Updated,
    /// Nothing changed
    Unchanged,
}

/// A status transition, queued for event delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Node whose status moved
    pub node_id: NodeId,
    /// Previous status
    pub from: NodeStatus,
    /// New status
    pub to: NodeStatus,
}

/// Registry of all known remote nodes
#[derive(Debug)]
pub struct NodeRegistry {
    local: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
    generation: u64,
    status_changes: Vec<StatusChange>,
}

impl NodeRegistry {
    /// Create an empty registry for `local`
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            nodes: BTreeMap::new(),
            generation: 0,
            status_changes: Vec::new(),
        }
    }

    /// Mutation counter
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Merge an observation into the registry
    ///
    /// Second-hand observations only ever create records; they never modify
    /// an existing one. First-hand observations win only if they are newer
    /// than the record's `last_seen`, so a replayed observation changes
    /// nothing.
    pub fn upsert(&mut self, observation: Observation) -> UpsertOutcome {
        if observation.node_id == self.local {
            return UpsertOutcome::Unchanged;
        }

        let Some(record) = self.nodes.get_mut(&observation.node_id) else {
            let status = match observation.kind {
                ObservationKind::Advertised => NodeStatus::Connecting,
                ObservationKind::DirectLink | ObservationKind::Originated => NodeStatus::Online,
            };
            let mut record =
                NodeRecord::new(observation.node_id.clone(), observation.observed_at, status);
            if let Some(name) = observation.device_name {
                record.device_name = name;
            }
            if let Some(address) = observation.link_address {
                record.link_address = address;
            }
            if observation.kind == ObservationKind::DirectLink {
                record.directly_connected = true;
                record.hop_distance = Some(1);
            }
            self.nodes.insert(observation.node_id, record);
            self.generation += 1;
            return UpsertOutcome::Inserted;
        };

        let mut changed = false;
        match observation.kind {
            ObservationKind::Advertised => return UpsertOutcome::Unchanged,
            ObservationKind::DirectLink => {
                if !record.directly_connected || record.timed_out {
                    record.directly_connected = true;
                    record.timed_out = false;
                    record.hop_distance = Some(1);
                    record.next_hop = None;
                    changed = true;
                }
                if observation.observed_at > record.last_seen {
                    record.last_seen = observation.observed_at;
                    changed = true;
                }
            },
            ObservationKind::Originated => {
                if observation.observed_at <= record.last_seen {
                    return UpsertOutcome::Unchanged;
                }
                record.last_seen = observation.observed_at;
                changed = true;
            },
        }

        if let Some(name) = observation.device_name {
            if record.device_name != name {
                record.device_name = name;
                changed = true;
            }
        }
        if let Some(address) = observation.link_address {
            if record.link_address != address {
                record.link_address = address;
                changed = true;
            }
        }

        let promote = match observation.kind {
            ObservationKind::DirectLink => record.status != NodeStatus::Online,
            _ => record.status == NodeStatus::Connecting,
        };
        let node_id = record.node_id.clone();
        if promote {
            self.set_status(&node_id, NodeStatus::Online);
            changed = true;
        }

        if changed {
            self.generation += 1;
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        }
    }

    /// Apply a heartbeat carrying the origin's `stamp`
    ///
    /// Returns `false` for unknown nodes and for stamps that are not newer
    /// than the last applied one.
    pub fn record_heartbeat(&mut self, node_id: &NodeId, stamp: u64, now: Instant) -> bool {
        let Some(record) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if stamp <= record.heartbeat_stamp {
            return false;
        }

        record.heartbeat_stamp = stamp;
        record.last_heartbeat = now;
        if now > record.last_seen {
            record.last_seen = now;
        }
        record.timed_out = false;

        if record.status != NodeStatus::Online {
            self.set_status(node_id, NodeStatus::Online);
        }
        self.generation += 1;
        true
    }

    /// Mark a node unreachable and invalidate every route through it
    ///
    /// Returns the node itself followed by every node whose route was reset.
    pub fn mark_unreachable(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(record) = self.nodes.get_mut(node_id) else {
            return Vec::new();
        };
        record.hop_distance = None;
        record.next_hop = None;
        record.directly_connected = false;
        self.set_status(node_id, NodeStatus::Unreachable);

        let mut affected = vec![node_id.clone()];
        affected.extend(self.cascade(node_id));
        self.generation += 1;
        affected
    }

    /// Mark a node silent past the heartbeat timeout
    ///
    /// Like [`mark_unreachable`](Self::mark_unreachable), and the node stays
    /// out of route computation until a heartbeat or direct link revives it.
    pub fn mark_timed_out(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        match self.nodes.get_mut(node_id) {
            Some(record) => record.timed_out = true,
            None => return Vec::new(),
        }
        self.mark_unreachable(node_id)
    }

    /// Record that the transport linked us to `node_id`
    ///
    /// Display metadata is taken from the frame that bound the link.
    pub fn link_established(
        &mut self,
        node_id: &NodeId,
        device_name: &str,
        link_address: &str,
        now: Instant,
    ) -> UpsertOutcome {
        self.upsert(
            Observation::new(node_id.clone(), ObservationKind::DirectLink, now)
                .with_names(device_name, link_address),
        )
    }

    /// Record that the direct link to `node_id` closed
    ///
    /// Returns the node itself followed by every node whose route was reset.
    pub fn link_lost(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(record) = self.nodes.get_mut(node_id) else {
            return Vec::new();
        };
        record.directly_connected = false;
        record.hop_distance = None;
        record.next_hop = None;
        if record.status != NodeStatus::Unreachable {
            self.set_status(node_id, NodeStatus::Offline);
        }

        let mut affected = vec![node_id.clone()];
        affected.extend(self.cascade(node_id));
        self.generation += 1;
        affected
    }

    fn cascade(&mut self, dead: &NodeId) -> Vec<NodeId> {
        let mut affected = Vec::new();
        let mut work = vec![dead.clone()];

        while let Some(relay) = work.pop() {
            let dependents: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.next_hop.as_ref() == Some(&relay))
                .map(|n| n.node_id.clone())
                .collect();

            for dependent in dependents {
                if let Some(record) = self.nodes.get_mut(&dependent) {
                    record.hop_distance = None;
                    record.next_hop = None;
                    if matches!(record.status, NodeStatus::Online | NodeStatus::Connecting) {
                        self.set_status(&dependent, NodeStatus::Unreachable);
                    }
                }
                work.push(dependent.clone());
                affected.push(dependent);
            }
        }

        affected
    }

    /// Replace the set of nodes `node_id` is known to be linked to
    pub fn set_connected_nodes(&mut self, node_id: &NodeId, neighbors: BTreeSet<NodeId>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(record) if record.connected_nodes != neighbors => {
                record.connected_nodes = neighbors;
                self.generation += 1;
                true
            },
            _ => false,
        }
    }

    /// Remove a node entirely
    pub fn evict(&mut self, node_id: &NodeId) -> Option<NodeRecord> {
        let removed = self.nodes.remove(node_id);
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    /// Copy a freshly computed route table into the records
    ///
    /// Route fields are derived data, so this does not bump the generation.
    pub(crate) fn apply_routes(&mut self, table: &RouteTable) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for node_id in ids {
            let Some(record) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            let route = if record.timed_out {
                None
            } else {
                table.route(&node_id)
            };

            let next_status = match route {
                Some(route) => {
                    record.hop_distance = Some(route.hop_distance);
                    record.directly_connected = route.hop_distance == 1;
                    record.next_hop = if route.hop_distance == 1 {
                        None
                    } else {
                        Some(route.next_hop.clone())
                    };
                    match record.status {
                        NodeStatus::Offline | NodeStatus::Unreachable => Some(NodeStatus::Online),
                        _ => None,
                    }
                },
                None => {
                    let was_routable = record.hop_distance.is_some();
                    record.hop_distance = None;
                    record.next_hop = None;
                    record.directly_connected = false;
                    match record.status {
                        NodeStatus::Online => Some(NodeStatus::Unreachable),
                        // Never routable: known only from afar, still connecting
                        NodeStatus::Connecting if was_routable => Some(NodeStatus::Unreachable),
                        _ => None,
                    }
                },
            };

            if let Some(status) = next_status {
                self.set_status(&node_id, status);
            }
        }
    }

    fn set_status(&mut self, node_id: &NodeId, status: NodeStatus) {
        if let Some(record) = self.nodes.get_mut(node_id) {
            if record.status != status {
                self.status_changes.push(StatusChange {
                    node_id: node_id.clone(),
                    from: record.status,
                    to: status,
                });
                record.status = status;
            }
        }
    }

    /// Take the status transitions queued since the last call
    pub fn drain_status_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.status_changes)
    }

    /// Look up a node
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    /// Whether a node is known
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All records, ordered by node ID
    pub fn all(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Nodes currently linked to the local node
    pub fn direct_neighbors(&self) -> Vec<&NodeRecord> {
        self.nodes.values().filter(|n| n.directly_connected).collect()
    }

    /// Nodes excluded from route computation by heartbeat timeout
    pub fn excluded(&self) -> HashSet<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.timed_out)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is known
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Forget every node
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.status_changes.clear();
        self.generation += 1;
    }
}
