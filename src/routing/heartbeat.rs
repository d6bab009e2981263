//! Heartbeat-based liveness detection
//!
//! The router floods a `Heartbeat` every `heartbeat_interval` and runs
//! [`HeartbeatMonitor::sweep`] on the same tick. A node silent for longer
//! than `heartbeat_timeout` is timed out, which cascades to every route
//! through it; a node left unreachable or offline for longer than
//! `eviction_timeout` is forgotten.

use crate::protocol::{HeartbeatPayload, NodeId};
use crate::routing::forwarding::LocalIdentity;
use crate::routing::node_registry::{NodeRecord, NodeRegistry, NodeStatus};
use crate::routing::topology::TopologyStore;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Nodes newly timed out
    pub timed_out: Vec<NodeId>,
    /// Nodes whose route was reset by a timeout cascade
    pub cascaded: Vec<NodeId>,
    /// Records removed from the registry
    pub evicted: Vec<NodeRecord>,
}

impl SweepReport {
    /// Whether the sweep changed anything
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.cascaded.is_empty() && self.evicted.is_empty()
    }
}

/// Timeout policy for node liveness
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    eviction_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor
    pub fn new(timeout: Duration, eviction_timeout: Duration) -> Self {
        Self {
            timeout,
            eviction_timeout,
        }
    }

    /// Payload announcing the local node
    pub fn payload(local: &LocalIdentity) -> HeartbeatPayload {
        HeartbeatPayload {
            device_name: local.device_name.clone(),
            link_address: local.link_address.clone(),
        }
    }

    /// Whether `record` has been silent past the heartbeat timeout
    ///
    /// A node only ever heard of second-hand and with no route is not
    /// expected to heartbeat to us, so it never expires.
    pub fn is_expired(&self, record: &NodeRecord, now: Instant) -> bool {
        if record.status == NodeStatus::Connecting && record.hop_distance.is_none() {
            return false;
        }
        now.saturating_duration_since(record.last_heartbeat) > self.timeout
    }

    /// Whether `record` is dead long enough to forget
    pub fn is_evictable(&self, record: &NodeRecord, now: Instant) -> bool {
        matches!(record.status, NodeStatus::Unreachable | NodeStatus::Offline)
            && now.saturating_duration_since(record.last_seen) > self.eviction_timeout
    }

    /// Time out silent nodes and evict long-dead ones
    pub fn sweep(
        &self,
        registry: &mut NodeRegistry,
        topology: &mut TopologyStore,
        now: Instant,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let expired: Vec<NodeId> = registry
            .all()
            .filter(|n| !n.is_timed_out() && self.is_expired(n, now))
            .map(|n| n.node_id.clone())
            .collect();

        for node_id in expired {
            // An earlier cascade may already have reset this node's route,
            // but it still needs the timeout flag
            let affected = registry.mark_timed_out(&node_id);
            report
                .cascaded
                .extend(affected.into_iter().filter(|n| *n != node_id));
            report.timed_out.push(node_id);
        }
        report.cascaded.retain(|n| !report.timed_out.contains(n));
        report.cascaded.sort();
        report.cascaded.dedup();

        // Far nodes linger while some advertisement still names them
        let named = topology.known_nodes();
        let evictable: Vec<NodeId> = registry
            .all()
            .filter(|n| {
                self.is_evictable(n, now)
                    || (n.status == NodeStatus::Connecting
                        && !named.contains(&n.node_id)
                        && now.saturating_duration_since(n.last_seen) > self.eviction_timeout)
            })
            .map(|n| n.node_id.clone())
            .collect();

        for node_id in evictable {
            topology.remove_node(&node_id);
            if let Some(record) = registry.evict(&node_id) {
                report.evicted.push(record);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::node_registry::{Observation, ObservationKind};

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(60), Duration::from_secs(180))
    }

    #[test]
    fn test_silent_node_times_out() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("A"), ObservationKind::DirectLink, start));
        topology.add_local_link(&id("A"));

        let report = monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(30));
        assert!(report.is_empty());

        let report = monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(61));
        assert_eq!(report.timed_out, vec![id("A")]);

        let a = registry.get(&id("A")).unwrap();
        assert_eq!(a.status, NodeStatus::Unreachable);
        assert!(a.is_timed_out());
    }

    #[test]
    fn test_timeout_is_reported_once() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("A"), ObservationKind::Originated, start));

        let later = start + Duration::from_secs(90);
        assert_eq!(monitor().sweep(&mut registry, &mut topology, later).timed_out.len(), 1);
        assert!(monitor().sweep(&mut registry, &mut topology, later).is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_node_alive() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("A"), ObservationKind::Originated, start));
        registry.record_heartbeat(&id("A"), 1, start + Duration::from_secs(50));

        let report = monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(100));
        assert!(report.timed_out.is_empty());
    }

    #[test]
    fn test_dead_node_is_evicted_everywhere() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("A"), ObservationKind::Originated, start));
        topology.apply_topology_advertisement(&id("B"), vec![id("A")], 1);

        monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(61));
        assert!(registry.contains(&id("A")));

        let report =
            monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(181));
        assert_eq!(report.evicted.len(), 1);
        assert!(!registry.contains(&id("A")));
        assert!(!topology.known_nodes().contains(&id("A")));
    }

    #[test]
    fn test_far_node_known_by_advertisement_does_not_expire() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("F"), ObservationKind::Advertised, start));
        topology.apply_topology_advertisement(&id("E"), vec![id("F")], 1);

        let report =
            monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(600));

        assert!(report.is_empty());
        assert_eq!(registry.get(&id("F")).unwrap().status, NodeStatus::Connecting);
    }

    #[test]
    fn test_far_node_forgotten_once_no_longer_advertised() {
        let start = Instant::now();
        let mut registry = NodeRegistry::new(id("L"));
        let mut topology = TopologyStore::new(id("L"));
        registry.upsert(Observation::new(id("F"), ObservationKind::Advertised, start));
        topology.apply_topology_advertisement(&id("E"), vec![id("F")], 1);
        topology.apply_topology_advertisement(&id("E"), Vec::new(), 2);

        let early = monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(60));
        assert!(early.evicted.is_empty());

        let report =
            monitor().sweep(&mut registry, &mut topology, start + Duration::from_secs(181));
        assert_eq!(report.evicted.len(), 1);
        assert!(!registry.contains(&id("F")));
    }
}
