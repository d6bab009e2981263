//! Node implementation - the main entry point for meshroute
//!
//! This module provides the `MeshNode` and `MeshNodeBuilder` types. A
//! `MeshNode` is a handle: starting it spawns the router task, and every
//! call afterwards is a command sent to that task or a read of the last
//! snapshot it published.

use crate::api::config::{MeshConfig, NetworkProfile};
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::error::{ConfigError, MeshError, RoutingError};
use crate::protocol::NodeId;
use crate::routing::{
    Command, DiscoveryState, LocalIdentity, MeshRouter, NodeRecord, Route, SendOutcome,
};
use crate::transport::{ConnectionState, LinkSender, Transport};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Current operational state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node has been created but not started
    Created,
    /// Router task is being spawned
    Starting,
    /// Node is running and ready to send/receive messages
    Running,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// Immutable view of the routing state
///
/// Published by the router after every change, so a snapshot is always
/// internally consistent: every node with a route in `routes` has the same
/// hop distance in `nodes`.
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    /// Local node ID
    pub local: NodeId,
    /// Local display name
    pub device_name: String,
    /// Link-level state
    pub connection_state: ConnectionState,
    /// Every known node, ordered by ID
    pub nodes: Vec<NodeRecord>,
    /// Every route, ordered by destination
    pub routes: Vec<Route>,
    /// Open links
    pub links: usize,
    /// Route discoveries in flight
    pub pending_discoveries: usize,
    /// Pending and recently finished route discoveries, ordered by target
    pub discoveries: Vec<(NodeId, DiscoveryState)>,
}

impl MeshSnapshot {
    pub(crate) fn empty(local: NodeId, device_name: String) -> Self {
        Self {
            local,
            device_name,
            connection_state: ConnectionState::Idle,
            nodes: Vec::new(),
            routes: Vec::new(),
            links: 0,
            pending_discoveries: 0,
            discoveries: Vec::new(),
        }
    }

    /// State of route discovery toward `target`
    pub fn discovery_state(&self, target: &NodeId) -> DiscoveryState {
        self.discoveries
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, state)| *state)
            .unwrap_or(DiscoveryState::Idle)
    }

    /// Look up a node
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id == *node_id)
    }

    /// Route to a node
    pub fn route(&self, node_id: &NodeId) -> Option<&Route> {
        self.routes.iter().find(|r| r.destination == *node_id)
    }

    /// Nodes with a known route
    pub fn reachable(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter().filter(|n| n.is_reachable())
    }

    /// Nodes linked to this one
    pub fn direct_neighbors(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter().filter(|n| n.directly_connected)
    }
}

/// Builder for creating MeshNode instances with progressive configuration
///
/// # Examples
///
/// ```no_run
/// use meshroute::api::{MeshNodeBuilder, NetworkProfile};
/// use meshroute::transport::memory::MemoryNetwork;
/// use std::sync::Arc;
///
/// # async fn example() -> meshroute::Result<()> {
/// let network = MemoryNetwork::new();
/// let mut node = MeshNodeBuilder::new()
///     .with_device_name("Kitchen tablet")
///     .with_network_profile(NetworkProfile::Relay)
///     .with_transport(Arc::new(network.endpoint()))
///     .build()?;
///
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct MeshNodeBuilder {
    config: MeshConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl MeshNodeBuilder {
    /// Create a new MeshNodeBuilder with default settings
    pub fn new() -> Self {
        Self {
            config: MeshConfig::default(),
            transport: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the display name announced to other nodes
    pub fn with_device_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.device_name = name.into();
        self
    }

    /// Set the transport address of this device
    ///
    /// A generated node ID is derived from it.
    pub fn with_link_address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.link_address = address.into();
        self
    }

    /// Use a fixed node ID instead of generating one
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.config.node_id = Some(node_id.into());
        self
    }

    /// Set the network profile preset
    ///
    /// This configures hop limit, connection cap and heartbeat timing at
    /// once. Setters called afterwards override individual values.
    pub fn with_network_profile(mut self, profile: NetworkProfile) -> Self {
        self.config.apply_profile(profile);
        self
    }

    /// Set the maximum number of links a message may cross
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.config.max_hops = max_hops;
        self
    }

    /// Set the maximum number of simultaneous links
    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the heartbeat period
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set how long a silent node stays reachable
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    /// Set how long an unreachable node is remembered
    pub fn with_eviction_timeout(mut self, timeout: Duration) -> Self {
        self.config.eviction_timeout = timeout;
        self
    }

    /// Set how long a route request waits for a reply
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery_timeout = timeout;
        self
    }

    /// Set the link transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the MeshNode instance
    ///
    /// Validates the configuration and resolves the node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no transport was
    /// given.
    pub fn build(self) -> crate::Result<MeshNode> {
        self.config.validate()?;

        let transport = self.transport.ok_or_else(|| ConfigError::InvalidValue {
            field: "transport",
            reason: "a transport is required".to_string(),
        })?;

        let mut config = self.config;
        let node_id = config.resolve_node_id();
        config.node_id = Some(node_id.clone());

        let (snapshots, _) = watch::channel(Arc::new(MeshSnapshot::empty(
            node_id.clone(),
            config.device_name.clone(),
        )));

        Ok(MeshNode {
            node_id,
            config,
            transport,
            event_handlers: EventHandlers::new(),
            state: Arc::new(RwLock::new(NodeState::Created)),
            runtime: Mutex::new(None),
            snapshots: Arc::new(snapshots),
        })
    }
}

impl Default for MeshNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Runtime {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// A participant in the mesh
///
/// # Examples
///
/// ```no_run
/// use meshroute::api::{Event, MeshNodeBuilder};
/// use meshroute::transport::memory::MemoryNetwork;
///
/// # async fn example() -> meshroute::Result<()> {
/// let network = MemoryNetwork::new();
/// let node = network
///     .spawn_node(MeshNodeBuilder::new().with_device_name("Alice"))
///     .await?;
///
/// node.on_event(|event| {
///     if let Event::ChatReceived { sender_name, content, .. } = event {
///         println!("{}: {}", sender_name, content);
///     }
/// });
///
/// node.broadcast("hello mesh").await?;
/// # Ok(())
/// # }
/// ```
pub struct MeshNode {
    node_id: NodeId,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    event_handlers: EventHandlers,
    state: Arc<RwLock<NodeState>>,
    runtime: Mutex<Option<Runtime>>,
    snapshots: Arc<watch::Sender<Arc<MeshSnapshot>>>,
}

impl MeshNode {
    // ========================================================================
    // Lifecycle Methods
    // ========================================================================

    /// Start the node
    ///
    /// Spawns the router task and transitions to the Running state.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::AlreadyRunning`] unless the node is Created or
    /// Stopped.
    pub async fn start(&mut self) -> crate::Result<()> {
        {
            let state = self.state.read();
            if *state != NodeState::Created && *state != NodeState::Stopped {
                return Err(MeshError::AlreadyRunning);
            }
        }

        *self.state.write() = NodeState::Starting;

        let identity = LocalIdentity {
            node_id: self.node_id.clone(),
            device_name: self.config.device_name.clone(),
            link_address: self.config.link_address.clone(),
        };
        let router = MeshRouter::new(
            identity,
            self.config.clone(),
            Arc::clone(&self.transport),
            self.event_handlers.clone(),
            Arc::clone(&self.snapshots),
        );
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(router.run(receiver));
        *self.runtime.lock() = Some(Runtime { commands, task });

        *self.state.write() = NodeState::Running;
        tracing::info!(node = %self.node_id, device = %self.config.device_name, "Mesh node started");
        self.event_handlers.dispatch(Event::NodeStarted);

        Ok(())
    }

    /// Stop the node
    ///
    /// Closes every link, fails pending sends and clears all routing state.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotRunning`] if the node is not running.
    pub async fn stop(&mut self) -> crate::Result<()> {
        {
            let state = self.state.read();
            if *state != NodeState::Running {
                return Err(MeshError::NotRunning);
            }
        }

        *self.state.write() = NodeState::Stopping;

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            let _ = runtime.commands.send(Command::Shutdown);
            if let Err(e) = runtime.task.await {
                tracing::warn!(node = %self.node_id, error = %e, "Router task ended abnormally");
            }
        }

        *self.state.write() = NodeState::Stopped;
        tracing::info!(node = %self.node_id, "Mesh node stopped");
        self.event_handlers.dispatch(Event::NodeStopped);

        Ok(())
    }

    /// Get the current operational state
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Get the node's unique identifier
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the configuration the node was built with
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Handle the transport reports link activity through
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotRunning`] if the node is not running.
    pub fn link_sender(&self) -> crate::Result<LinkSender> {
        Ok(LinkSender::new(self.commands()?))
    }

    fn commands(&self) -> crate::Result<mpsc::UnboundedSender<Command>> {
        self.runtime
            .lock()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(MeshError::NotRunning)
    }

    // ========================================================================
    // Event System
    // ========================================================================

    /// Register an event handler
    ///
    /// The handler runs on the router task and should return quickly.
    ///
    /// # Returns
    ///
    /// A `SubscriptionHandle` that can be used to unsubscribe.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.event_handlers.subscribe(handler)
    }

    /// Unsubscribe an event handler
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.event_handlers.unsubscribe(handle);
    }

    // ========================================================================
    // Message Sending
    // ========================================================================

    /// Send a chat message to one node, or to everyone with `None`
    ///
    /// A send to a node with no known route waits for route discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The node is not running
    /// - `target` is this node
    /// - No route to `target` was found before the discovery timeout
    /// - The transport rejected the frame
    pub async fn send_chat_message(
        &self,
        target: Option<&NodeId>,
        text: impl Into<String>,
    ) -> crate::Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendChat {
            target: target.cloned(),
            content: text.into(),
            reply,
        })?;
        self.await_reply(target, rx).await
    }

    /// Send a chat message to every node within the hop limit
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotRunning`] if the node is not running.
    pub async fn broadcast(&self, text: impl Into<String>) -> crate::Result<SendOutcome> {
        self.send_chat_message(None, text).await
    }

    /// Ask a node to flood a fresh topology advertisement
    ///
    /// # Errors
    ///
    /// Fails like [`send_chat_message`](Self::send_chat_message).
    pub async fn request_topology(&self, node_id: &NodeId) -> crate::Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RequestTopology {
            node_id: node_id.clone(),
            reply,
        })?;
        self.await_reply(Some(node_id), rx).await
    }

    /// Abandon route discovery for a target
    ///
    /// Sends waiting on it fail with `NoRoute`. Returns whether a discovery
    /// was pending.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotRunning`] if the node is not running.
    pub async fn cancel_discovery(&self, target: &NodeId) -> crate::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CancelDiscovery {
            target: target.clone(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::EngineStopped)
    }

    fn command(&self, command: Command) -> crate::Result<()> {
        self.commands()?
            .send(command)
            .map_err(|_| MeshError::EngineStopped)
    }

    async fn await_reply(
        &self,
        target: Option<&NodeId>,
        rx: oneshot::Receiver<crate::Result<SendOutcome>>,
    ) -> crate::Result<SendOutcome> {
        let limit = self.config.discovery_timeout * 2 + Duration::from_secs(1);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::EngineStopped),
            Err(_) => Err(match target {
                Some(target) => RoutingError::NoRoute {
                    target: target.clone(),
                }
                .into(),
                None => MeshError::EngineStopped,
            }),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Latest published routing state
    pub fn snapshot(&self) -> Arc<MeshSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever a new snapshot is published
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<MeshSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Every known node
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.snapshot().nodes.clone()
    }

    /// Look up one node
    pub fn node(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.snapshot().node(node_id).cloned()
    }

    /// Link-level state
    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot().connection_state
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            let _ = runtime.commands.send(Command::Shutdown);
        }
    }
}
