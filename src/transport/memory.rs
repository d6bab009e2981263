//! In-memory link layer for testing
//!
//! [`MemoryNetwork`] connects mesh nodes inside one process. Links are
//! created and torn down explicitly, so tests can build any topology and
//! then break it. Frames are handed straight to the remote node's
//! [`LinkSender`].

use crate::api::node::{MeshNode, MeshNodeBuilder};
use crate::error::{MeshError, Result, RoutingError, TransportError};
use crate::protocol::{NodeId, PeerHandle};
use crate::transport::{LinkSender, Transport};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type EndpointId = u64;

/// One direction of a link: where frames sent on a handle end up
#[derive(Debug, Clone, Copy)]
struct LinkEnd {
    remote: EndpointId,
    remote_handle: PeerHandle,
}

struct Inner {
    next_id: AtomicU64,
    senders: DashMap<EndpointId, LinkSender>,
    links: DashMap<(EndpointId, PeerHandle), LinkEnd>,
    nodes: DashMap<NodeId, EndpointId>,
    muted: DashSet<EndpointId>,
}

impl Inner {
    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sender(&self, endpoint: EndpointId) -> Option<LinkSender> {
        self.senders.get(&endpoint).map(|s| s.value().clone())
    }

    fn unlink(&self, endpoint: EndpointId, handle: PeerHandle) -> bool {
        let Some((_, end)) = self.links.remove(&(endpoint, handle)) else {
            return false;
        };
        self.links.remove(&(end.remote, end.remote_handle));

        if let Some(sender) = self.sender(endpoint) {
            let _ = sender.disconnected(handle);
        }
        if let Some(sender) = self.sender(end.remote) {
            let _ = sender.disconnected(end.remote_handle);
        }
        true
    }
}

/// Registry of in-process endpoints and the links between them
///
/// # Examples
///
/// ```no_run
/// use meshroute::api::MeshNodeBuilder;
/// use meshroute::transport::memory::MemoryNetwork;
///
/// # async fn example() -> meshroute::Result<()> {
/// let network = MemoryNetwork::new();
/// let a = network.spawn_node(MeshNodeBuilder::new().with_node_id("A")).await?;
/// let b = network.spawn_node(MeshNodeBuilder::new().with_node_id("B")).await?;
///
/// network.connect(a.node_id(), b.node_id())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                senders: DashMap::new(),
                links: DashMap::new(),
                nodes: DashMap::new(),
                muted: DashSet::new(),
            }),
        }
    }

    /// Create an unattached endpoint
    pub fn endpoint(&self) -> MemoryTransport {
        MemoryTransport {
            endpoint: self.inner.allocate(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Attach a running node to an endpoint
    pub fn attach(&self, transport: &MemoryTransport, node_id: &NodeId, sender: LinkSender) {
        self.inner.senders.insert(transport.endpoint, sender);
        self.inner.nodes.insert(node_id.clone(), transport.endpoint);
    }

    /// Build, start and attach a node in one step
    ///
    /// # Errors
    ///
    /// Returns an error if the builder's configuration is invalid.
    pub async fn spawn_node(&self, builder: MeshNodeBuilder) -> Result<MeshNode> {
        let transport = self.endpoint();
        let mut node = builder.with_transport(Arc::new(transport.clone())).build()?;
        node.start().await?;
        self.attach(&transport, node.node_id(), node.link_sender()?);
        Ok(node)
    }

    fn endpoint_of(&self, node_id: &NodeId) -> Result<EndpointId> {
        self.inner
            .nodes
            .get(node_id)
            .map(|e| *e.value())
            .ok_or_else(|| {
                MeshError::from(RoutingError::PeerUnreachable {
                    node_id: node_id.clone(),
                })
            })
    }

    /// Link two nodes; returns the handle each side sees the other under
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PeerUnreachable`] if either node is not
    /// attached.
    pub fn connect(&self, a: &NodeId, b: &NodeId) -> Result<(PeerHandle, PeerHandle)> {
        let ea = self.endpoint_of(a)?;
        let eb = self.endpoint_of(b)?;

        let ha = PeerHandle::new(self.inner.allocate());
        let hb = PeerHandle::new(self.inner.allocate());
        self.inner.links.insert(
            (ea, ha),
            LinkEnd {
                remote: eb,
                remote_handle: hb,
            },
        );
        self.inner.links.insert(
            (eb, hb),
            LinkEnd {
                remote: ea,
                remote_handle: ha,
            },
        );

        if let Some(sender) = self.inner.sender(ea) {
            sender.connected(ha)?;
        }
        if let Some(sender) = self.inner.sender(eb) {
            sender.connected(hb)?;
        }
        Ok((ha, hb))
    }

    /// Tear down every link between two nodes
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) -> Result<usize> {
        let ea = self.endpoint_of(a)?;
        let eb = self.endpoint_of(b)?;

        let handles: Vec<PeerHandle> = self
            .inner
            .links
            .iter()
            .filter(|entry| entry.key().0 == ea && entry.value().remote == eb)
            .map(|entry| entry.key().1)
            .collect();

        Ok(handles
            .into_iter()
            .filter(|h| self.inner.unlink(ea, *h))
            .count())
    }

    /// Silently drop every frame a node sends, keeping its links up
    pub fn set_muted(&self, node_id: &NodeId, muted: bool) -> Result<()> {
        let endpoint = self.endpoint_of(node_id)?;
        if muted {
            self.inner.muted.insert(endpoint);
        } else {
            self.inner.muted.remove(&endpoint);
        }
        Ok(())
    }

    /// Tear down a node's links and forget it
    pub fn detach(&self, node_id: &NodeId) {
        let Some((_, endpoint)) = self.inner.nodes.remove(node_id) else {
            return;
        };
        let handles: Vec<PeerHandle> = self
            .inner
            .links
            .iter()
            .filter(|entry| entry.key().0 == endpoint)
            .map(|entry| entry.key().1)
            .collect();
        for handle in handles {
            self.inner.unlink(endpoint, handle);
        }
        self.inner.senders.remove(&endpoint);
        self.inner.muted.remove(&endpoint);
    }

    /// Number of attached nodes
    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Number of links (each counted once)
    pub fn link_count(&self) -> usize {
        self.inner.links.len() / 2
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A node's view of the [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: EndpointId,
    inner: Arc<Inner>,
}

impl Transport for MemoryTransport {
    fn send_frame(&self, peer: PeerHandle, frame: Vec<u8>) -> std::result::Result<(), TransportError> {
        let end = self
            .inner
            .links
            .get(&(self.endpoint, peer))
            .map(|e| *e.value())
            .ok_or(TransportError::PeerNotConnected { peer })?;

        if self.inner.muted.contains(&self.endpoint) {
            return Ok(());
        }

        let sender = self
            .inner
            .sender(end.remote)
            .ok_or(TransportError::PeerNotConnected { peer })?;

        sender
            .frame_received(end.remote_handle, frame)
            .map_err(|e| TransportError::SendFailed {
                peer,
                reason: e.to_string(),
            })
    }

    fn close_link(&self, peer: PeerHandle) {
        self.inner.unlink(self.endpoint, peer);
    }
}
