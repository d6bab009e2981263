//! Common test helpers and utilities
//!
//! This module provides shared fixtures for integration tests: tracing
//! setup, node and topology builders over the in-memory network, an event
//! recorder and polling helpers.

#![allow(dead_code)]

use meshroute::api::{Event, MeshNode, MeshNodeBuilder};
use meshroute::transport::memory::MemoryNetwork;
use meshroute::{MessageId, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Install a test-friendly tracing subscriber once
///
/// Honors `RUST_LOG`, e.g. `RUST_LOG=meshroute=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shorthand for a node ID
pub fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

/// Builder with a fixed node ID and a matching device name
pub fn builder(name: &str) -> MeshNodeBuilder {
    MeshNodeBuilder::new()
        .with_node_id(name)
        .with_device_name(format!("{} phone", name))
}

/// Spawn one node per name with a shared customization
pub async fn spawn_nodes<F>(network: &MemoryNetwork, names: &[&str], customize: F) -> Vec<MeshNode>
where
    F: Fn(MeshNodeBuilder) -> MeshNodeBuilder,
{
    let mut nodes = Vec::with_capacity(names.len());
    for name in names {
        let node = network
            .spawn_node(customize(builder(name)))
            .await
            .unwrap();
        nodes.push(node);
    }
    nodes
}

/// Link every pair and wait until both ends have bound the link
pub async fn link_all(network: &MemoryNetwork, nodes: &[MeshNode], pairs: &[(usize, usize)]) {
    for &(a, b) in pairs {
        network
            .connect(nodes[a].node_id(), nodes[b].node_id())
            .unwrap();
    }
    for &(a, b) in pairs {
        let (na, nb) = (&nodes[a], &nodes[b]);
        assert!(
            wait_for(|| is_direct(na, nb.node_id()) && is_direct(nb, na.node_id())).await,
            "link {} <-> {} never bound",
            na.node_id(),
            nb.node_id()
        );
    }
}

/// Spawn a line `names[0] - names[1] - ... - names[n-1]`
pub async fn line<F>(network: &MemoryNetwork, names: &[&str], customize: F) -> Vec<MeshNode>
where
    F: Fn(MeshNodeBuilder) -> MeshNodeBuilder,
{
    let nodes = spawn_nodes(network, names, customize).await;
    let pairs: Vec<(usize, usize)> = (1..names.len()).map(|i| (i - 1, i)).collect();
    link_all(network, &nodes, &pairs).await;
    nodes
}

/// Whether `node` currently sees `peer` as a direct neighbor
pub fn is_direct(node: &MeshNode, peer: &NodeId) -> bool {
    node.node(peer).is_some_and(|n| n.directly_connected)
}

/// Poll `condition` every 10 ms for up to 2 s
pub async fn wait_for<F: FnMut() -> bool>(condition: F) -> bool {
    wait_for_within(Duration::from_secs(2), condition).await
}

/// Poll `condition` every 10 ms until `limit` elapses
pub async fn wait_for_within<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A chat message as the receiving application saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedChat {
    pub message_id: MessageId,
    pub source: NodeId,
    pub target: Option<NodeId>,
    pub content: String,
    pub hop_count: u32,
}

/// Records every event a node dispatches
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Start recording `node`'s events
    pub fn attach(node: &MeshNode) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        node.on_event(move |event| events.lock().push(event));
        log
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Received chat messages, in arrival order
    pub fn chats(&self) -> Vec<ReceivedChat> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::ChatReceived {
                    message_id,
                    source,
                    target,
                    content,
                    hop_count,
                    ..
                } => Some(ReceivedChat {
                    message_id: *message_id,
                    source: source.clone(),
                    target: target.clone(),
                    content: content.clone(),
                    hop_count: *hop_count,
                }),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`
    pub fn count<F: Fn(&Event) -> bool>(&self, predicate: F) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!wait_for_within(Duration::from_millis(30), || false).await);
        assert!(wait_for(|| true).await);
    }

    #[tokio::test]
    async fn test_line_binds_every_link() {
        let network = MemoryNetwork::new();
        let nodes = line(&network, &["A", "B", "C"], |b| b).await;

        assert_eq!(network.link_count(), 2);
        assert!(is_direct(&nodes[1], &id("A")));
        assert!(is_direct(&nodes[1], &id("C")));
    }
}
