//! Route table computation
//!
//! Routes are derived data: a breadth-first search from the local node over
//! the topology graph. The table is never patched in place; any change to
//! the registry or topology produces a fresh table on the next lookup.

use crate::protocol::NodeId;
use crate::routing::node_registry::NodeRegistry;
use crate::routing::topology::TopologyStore;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Information about a route to a destination node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination node ID
    pub destination: NodeId,
    /// Direct neighbor to hand the message to
    pub next_hop: NodeId,
    /// Number of links between the local node and the destination
    pub hop_distance: u32,
}

impl Route {
    /// Create a new route
    pub fn new(destination: NodeId, next_hop: NodeId, hop_distance: u32) -> Self {
        Self {
            destination,
            next_hop,
            hop_distance,
        }
    }

    /// Whether the destination is a direct neighbor
    pub fn is_direct(&self) -> bool {
        self.hop_distance == 1
    }
}

/// Shortest-hop routes from the local node
#[derive(Debug, Clone)]
pub struct RouteTable {
    local: NodeId,
    routes: BTreeMap<NodeId, Route>,
    parents: HashMap<NodeId, NodeId>,
}

impl RouteTable {
    /// An empty table
    pub fn empty(local: NodeId) -> Self {
        Self {
            local,
            routes: BTreeMap::new(),
            parents: HashMap::new(),
        }
    }

    /// Run the breadth-first search over the whole graph
    pub fn compute(topology: &TopologyStore, excluded: &HashSet<NodeId>) -> Self {
        Self::compute_within(topology, excluded, u32::MAX)
    }

    /// Run the breadth-first search, stopping at `max_depth` hops
    ///
    /// Neighbors are expanded in ascending identifier order, so among
    /// equal-length paths the one through the lowest-id direct neighbor
    /// wins. Nodes in `excluded` are neither routed to nor through. Nodes
    /// farther than `max_depth` get no route, since no message could reach
    /// them.
    pub fn compute_within(
        topology: &TopologyStore,
        excluded: &HashSet<NodeId>,
        max_depth: u32,
    ) -> Self {
        let local = topology.local().clone();
        if max_depth == 0 {
            return Self::empty(local);
        }
        let mut table = Self::empty(local.clone());
        let mut queue = VecDeque::new();

        for neighbor in topology.local_links() {
            if excluded.contains(neighbor) {
                continue;
            }
            table
                .routes
                .insert(neighbor.clone(), Route::new(neighbor.clone(), neighbor.clone(), 1));
            table.parents.insert(neighbor.clone(), local.clone());
            queue.push_back(neighbor.clone());
        }

        while let Some(node) = queue.pop_front() {
            let Some((first_hop, depth)) = table
                .routes
                .get(&node)
                .map(|r| (r.next_hop.clone(), r.hop_distance))
            else {
                continue;
            };
            if depth >= max_depth {
                continue;
            }
            let Some(neighbors) = topology.neighbors_of(&node) else {
                continue;
            };

            for next in neighbors {
                if *next == local || excluded.contains(next) || table.routes.contains_key(next) {
                    continue;
                }
                table.routes.insert(
                    next.clone(),
                    Route::new(next.clone(), first_hop.clone(), depth + 1),
                );
                table.parents.insert(next.clone(), node.clone());
                queue.push_back(next.clone());
            }
        }

        table
    }

    /// Build a table from explicit routes, without parents
    #[cfg(test)]
    pub(crate) fn from_routes(local: NodeId, routes: Vec<Route>) -> Self {
        let mut table = Self::empty(local);
        for route in routes {
            table.routes.insert(route.destination.clone(), route);
        }
        table
    }

    /// Route to `destination`
    pub fn route(&self, destination: &NodeId) -> Option<&Route> {
        self.routes.get(destination)
    }

    /// Node through which BFS first reached `node`
    pub fn parent(&self, node: &NodeId) -> Option<&NodeId> {
        self.parents.get(node)
    }

    /// Full path from the local node to `target`, both inclusive
    pub fn path_to(&self, target: &NodeId) -> Option<Vec<NodeId>> {
        if *target == self.local {
            return Some(vec![self.local.clone()]);
        }
        self.routes.get(target)?;

        let mut path = vec![target.clone()];
        let mut cursor = target;
        while let Some(parent) = self.parents.get(cursor) {
            path.push(parent.clone());
            if *parent == self.local {
                path.reverse();
                return Some(path);
            }
            cursor = parent;
        }
        None
    }

    /// All routes, ordered by destination
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Number of reachable nodes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is reachable
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Memoised route table keyed on the registry and topology generations
#[derive(Debug)]
pub struct RouteCache {
    key: Option<(u64, u64)>,
    table: Arc<RouteTable>,
    max_hops: u32,
}

impl RouteCache {
    /// Create an empty cache for routes of at most `max_hops` hops
    pub fn new(local: NodeId, max_hops: u32) -> Self {
        Self {
            key: None,
            table: Arc::new(RouteTable::empty(local)),
            max_hops,
        }
    }

    /// Current table, recomputing it if either input changed
    ///
    /// A recomputation is copied into the registry before returning, so the
    /// route fields of every record always agree with the returned table.
    pub fn refresh(
        &mut self,
        registry: &mut NodeRegistry,
        topology: &TopologyStore,
    ) -> Arc<RouteTable> {
        let key = (registry.generation(), topology.generation());
        if self.key != Some(key) {
            let table =
                RouteTable::compute_within(topology, &registry.excluded(), self.max_hops);
            registry.apply_routes(&table);
            self.table = Arc::new(table);
            self.key = Some((registry.generation(), topology.generation()));
        }
        Arc::clone(&self.table)
    }

    /// Last computed table, possibly stale
    pub fn current(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table)
    }

    /// Force the next lookup to recompute
    pub fn invalidate(&mut self) {
        self.key = None;
    }
}
