//! Topology store: who is linked to whom
//!
//! Links touching the local node come only from direct transport
//! observation. Every other edge is directed from a remote node's own view
//! and comes either from that node's topology advertisement or from a route
//! path learned through discovery.

use crate::protocol::NodeId;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
struct Adjacency {
    neighbors: BTreeSet<NodeId>,
    advertised_at: u64,
}

/// Adjacency map keyed by node ID
#[derive(Debug)]
pub struct TopologyStore {
    local: NodeId,
    local_links: BTreeSet<NodeId>,
    adjacency: HashMap<NodeId, Adjacency>,
    generation: u64,
}

impl TopologyStore {
    /// Create an empty store for `local`
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            local_links: BTreeSet::new(),
            adjacency: HashMap::new(),
            generation: 0,
        }
    }

    /// Mutation counter
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The node this store belongs to
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Record a direct link observed by the transport
    pub fn add_local_link(&mut self, node_id: &NodeId) -> bool {
        if *node_id == self.local {
            return false;
        }
        let added = self.local_links.insert(node_id.clone());
        if added {
            self.generation += 1;
        }
        added
    }

    /// Drop a direct link
    pub fn remove_local_link(&mut self, node_id: &NodeId) -> bool {
        let removed = self.local_links.remove(node_id);
        if removed {
            self.generation += 1;
        }
        removed
    }

    /// Local node's current direct links
    pub fn local_links(&self) -> &BTreeSet<NodeId> {
        &self.local_links
    }

    /// Replace `node_id`'s adjacency with an advertised neighbor set
    ///
    /// Applies only when `timestamp` is newer than the last advertisement
    /// from that node and the set actually differs. Returns whether the
    /// store changed.
    pub fn apply_topology_advertisement(
        &mut self,
        node_id: &NodeId,
        neighbors: impl IntoIterator<Item = NodeId>,
        timestamp: u64,
    ) -> bool {
        if *node_id == self.local {
            return false;
        }

        let neighbors: BTreeSet<NodeId> = neighbors
            .into_iter()
            .filter(|n| n != node_id && !n.is_empty())
            .collect();

        let entry = self.adjacency.entry(node_id.clone()).or_default();
        if timestamp <= entry.advertised_at {
            return false;
        }
        entry.advertised_at = timestamp;

        if entry.neighbors == neighbors {
            return false;
        }
        entry.neighbors = neighbors;
        self.generation += 1;
        true
    }

    /// Learn the links along a discovered path
    ///
    /// Both directions are recorded for every consecutive pair of remote
    /// nodes. Pairs involving the local node are skipped.
    pub fn record_path(&mut self, path: &[NodeId]) -> bool {
        let mut changed = false;
        for pair in path.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a == b || *a == self.local || *b == self.local {
                continue;
            }
            changed |= self.insert_edge(a, b);
            changed |= self.insert_edge(b, a);
        }
        if changed {
            self.generation += 1;
        }
        changed
    }

    fn insert_edge(&mut self, from: &NodeId, to: &NodeId) -> bool {
        self.adjacency
            .entry(from.clone())
            .or_default()
            .neighbors
            .insert(to.clone())
    }

    /// Forget a node: its adjacency, its local link and every edge to it
    pub fn remove_node(&mut self, node_id: &NodeId) -> bool {
        let mut changed = self.local_links.remove(node_id);
        changed |= self.adjacency.remove(node_id).is_some();
        for adjacency in self.adjacency.values_mut() {
            changed |= adjacency.neighbors.remove(node_id);
        }
        if changed {
            self.generation += 1;
        }
        changed
    }

    /// Neighbors of `node_id`, in ascending identifier order
    pub fn neighbors_of(&self, node_id: &NodeId) -> Option<&BTreeSet<NodeId>> {
        if *node_id == self.local {
            return Some(&self.local_links);
        }
        self.adjacency.get(node_id).map(|a| &a.neighbors)
    }

    /// Every node that appears anywhere in the graph
    pub fn known_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes: BTreeSet<NodeId> = self.local_links.iter().cloned().collect();
        for (node, adjacency) in &self.adjacency {
            nodes.insert(node.clone());
            nodes.extend(adjacency.neighbors.iter().cloned());
        }
        nodes.remove(&self.local);
        nodes
    }

    /// Number of directed edges, local links included
    pub fn edge_count(&self) -> usize {
        let directed: usize = self.adjacency.values().map(|a| a.neighbors.len()).sum();
        self.local_links.len() + directed
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.local_links.clear();
        self.adjacency.clear();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn test_local_links() {
        let mut store = TopologyStore::new(id("L"));
        assert!(store.add_local_link(&id("A")));
        assert!(!store.add_local_link(&id("A")));
        assert!(!store.add_local_link(&id("L")));

        let neighbors = store.neighbors_of(&id("L")).unwrap();
        assert!(neighbors.contains(&id("A")));

        assert!(store.remove_local_link(&id("A")));
        assert!(store.neighbors_of(&id("L")).unwrap().is_empty());
    }

    #[test]
    fn test_advertisement_requires_newer_timestamp() {
        let mut store = TopologyStore::new(id("L"));
        assert!(store.apply_topology_advertisement(&id("A"), ids(&["B", "C"]), 10));

        // older
        assert!(!store.apply_topology_advertisement(&id("A"), ids(&["D"]), 5));
        // same stamp
        assert!(!store.apply_topology_advertisement(&id("A"), ids(&["D"]), 10));

        let neighbors = store.neighbors_of(&id("A")).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&id("B")));
    }

    #[test]
    fn test_identical_advertisement_is_idempotent() {
        let mut store = TopologyStore::new(id("L"));
        store.apply_topology_advertisement(&id("A"), ids(&["B"]), 10);
        let generation = store.generation();

        assert!(!store.apply_topology_advertisement(&id("A"), ids(&["B"]), 10));
        assert!(!store.apply_topology_advertisement(&id("A"), ids(&["B"]), 11));
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_advertisement_filters_self_loops() {
        let mut store = TopologyStore::new(id("L"));
        store.apply_topology_advertisement(&id("A"), ids(&["A", "B"]), 1);
        let neighbors = store.neighbors_of(&id("A")).unwrap();
        assert!(!neighbors.contains(&id("A")));
        assert!(neighbors.contains(&id("B")));
    }

    #[test]
    fn test_record_path_skips_local_links() {
        let mut store = TopologyStore::new(id("L"));
        assert!(store.record_path(&ids(&["L", "A", "B", "C"])));

        assert!(store.neighbors_of(&id("L")).unwrap().is_empty());
        assert!(store.neighbors_of(&id("A")).unwrap().contains(&id("B")));
        assert!(store.neighbors_of(&id("B")).unwrap().contains(&id("A")));
        assert!(store.neighbors_of(&id("C")).unwrap().contains(&id("B")));
        assert!(!store.neighbors_of(&id("A")).unwrap().contains(&id("L")));

        let generation = store.generation();
        assert!(!store.record_path(&ids(&["L", "A", "B", "C"])));
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_remove_node_drops_all_edges() {
        let mut store = TopologyStore::new(id("L"));
        store.add_local_link(&id("A"));
        store.apply_topology_advertisement(&id("A"), ids(&["B"]), 1);
        store.apply_topology_advertisement(&id("B"), ids(&["A", "C"]), 1);

        assert!(store.remove_node(&id("A")));

        assert!(store.local_links().is_empty());
        assert!(store.neighbors_of(&id("A")).is_none());
        assert!(!store.neighbors_of(&id("B")).unwrap().contains(&id("A")));
        assert!(!store.known_nodes().contains(&id("A")));
    }
}
