//! Main routing logic for message delivery
//!
//! [`MeshRouter`] is a single task that owns every piece of routing state:
//! the node registry, the topology store, the route cache, pending
//! discoveries and the duplicate cache. Link events, sends and timers all
//! arrive through one command queue or one `select!`, so an update and the
//! route invalidation it causes are applied together, and forwarding always
//! reads a consistent table.
//!
//! After every step the router publishes an immutable [`MeshSnapshot`] for
//! readers outside the task.

use crate::api::config::MeshConfig;
use crate::api::events::{Event, EventHandlers};
use crate::api::node::MeshSnapshot;
use crate::error::{MeshError, ProtocolError, RoutingError};
use crate::protocol::payloads::{node_ids, wire_ids};
use crate::protocol::{
    decode_frame, decode_payload, encode_frame, encode_payload, HeartbeatPayload, MeshMessage,
    MessageId, MessageType, NodeAnnouncement, NodeId, PeerHandle, RouteReplyPayload,
    RouteRequestPayload, StampClock, TopologyAdvertisement,
};
use crate::routing::dedup::{MessageKey, SeenCache};
use crate::routing::discovery::{
    Begin, Discovery, DiscoveryState, PendingRequest, QueuedMessage, Responder,
};
use crate::routing::forwarding::{
    classify, is_loop_free, should_forward_message, stamp_for_transmit, Disposition,
    LocalIdentity,
};
use crate::routing::heartbeat::HeartbeatMonitor;
use crate::routing::node_registry::{NodeRegistry, Observation, ObservationKind, UpsertOutcome};
use crate::routing::routing_table::{RouteCache, RouteTable};
use crate::routing::topology::TopologyStore;
use crate::transport::{ConnectionState, LinkEvent, Transport};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Flooded to every direct neighbor
    Broadcast {
        /// Identifier of the sent message
        message_id: MessageId,
        /// Number of links the message was handed to
        peers: usize,
    },
    /// Handed to the next hop toward the target
    Forwarded {
        /// Identifier of the sent message
        message_id: MessageId,
        /// Direct neighbor the message was handed to
        next_hop: NodeId,
        /// Hops between this node and the target
        hop_distance: u32,
    },
}

impl SendOutcome {
    /// Identifier of the sent message
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Broadcast { message_id, .. } | Self::Forwarded { message_id, .. } => *message_id,
        }
    }
}

/// Input to the router task
#[derive(Debug)]
pub(crate) enum Command {
    /// Activity reported by the transport
    Link(LinkEvent),
    /// Originate a chat message
    SendChat {
        target: Option<NodeId>,
        content: String,
        reply: Responder,
    },
    /// Ask a node to flood its adjacency
    RequestTopology { node_id: NodeId, reply: Responder },
    /// Abandon route discovery for a target
    CancelDiscovery {
        target: NodeId,
        reply: oneshot::Sender<bool>,
    },
    /// Stop the task
    Shutdown,
}

/// The routing engine task
pub(crate) struct MeshRouter {
    local: LocalIdentity,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    events: EventHandlers,
    snapshots: Arc<watch::Sender<Arc<MeshSnapshot>>>,

    registry: NodeRegistry,
    topology: TopologyStore,
    routes: RouteCache,
    discovery: Discovery,
    heartbeat: HeartbeatMonitor,
    seen: SeenCache<MessageKey>,

    /// Every open link, with the node bound to it once known
    peers: BTreeMap<PeerHandle, Option<NodeId>>,
    peer_of: HashMap<NodeId, PeerHandle>,

    clock: StampClock,
    sequence: u64,
    connection_state: ConnectionState,
    published: Option<(u64, u64, u64, usize, ConnectionState)>,
    last_routes: Option<Arc<RouteTable>>,
}

impl MeshRouter {
    pub(crate) fn new(
        local: LocalIdentity,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        events: EventHandlers,
        snapshots: Arc<watch::Sender<Arc<MeshSnapshot>>>,
    ) -> Self {
        let node_id = local.node_id.clone();
        Self {
            registry: NodeRegistry::new(node_id.clone()),
            topology: TopologyStore::new(node_id.clone()),
            routes: RouteCache::new(node_id, config.max_hops),
            discovery: Discovery::new(
                config.discovery_timeout,
                config.request_window,
                config.dedup_capacity,
                config.relay_buffer_limit,
            ),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_timeout, config.eviction_timeout),
            seen: SeenCache::new(config.dedup_window, config.dedup_capacity),
            peers: BTreeMap::new(),
            peer_of: HashMap::new(),
            clock: StampClock::new(),
            sequence: 0,
            connection_state: ConnectionState::Idle,
            published: None,
            last_routes: None,
            local,
            config,
            transport,
            events,
            snapshots,
        }
    }

    /// Run until shutdown or until every command sender is gone
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut topology = interval_at(
            start + self.config.topology_interval,
            self.config.topology_interval,
        );
        topology.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(node = %self.local.node_id, "Mesh router started");
        self.set_connection_state(ConnectionState::Listening);
        self.settle();

        loop {
            let deadline = self.discovery.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
                _ = topology.tick() => self.on_topology_tick(),
                _ = wait_until(deadline) => self.on_discovery_deadline(),
            }
            self.settle();
        }

        self.shutdown();
        info!(node = %self.local.node_id, "Mesh router stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Link(LinkEvent::Connected(peer)) => self.on_link_connected(peer),
            Command::Link(LinkEvent::Disconnected(peer)) => self.on_link_disconnected(peer),
            Command::Link(LinkEvent::Frame { peer, bytes }) => self.on_frame(peer, &bytes),
            Command::SendChat {
                target,
                content,
                reply,
            } => self.send_chat(target, content, reply),
            Command::RequestTopology { node_id, reply } => self.request_topology(node_id, reply),
            Command::CancelDiscovery { target, reply } => {
                let cancelled = match self.discovery.cancel(&target) {
                    Some(pending) => {
                        self.fail_pending(pending, DiscoveryState::Cancelled);
                        true
                    },
                    None => false,
                };
                let _ = reply.send(cancelled);
            },
            Command::Shutdown => {},
        }
    }

    // ========================================================================
    // Link events
    // ========================================================================

    fn on_link_connected(&mut self, peer: PeerHandle) {
        if self.peers.contains_key(&peer) {
            return;
        }
        if self.peers.len() >= self.config.max_connections {
            warn!(
                peer = %peer,
                max_connections = self.config.max_connections,
                "Connection limit reached, closing link"
            );
            self.transport.close_link(peer);
            return;
        }

        debug!(peer = %peer, "Link up");
        self.peers.insert(peer, None);
        self.set_connection_state(ConnectionState::Connected);

        // Introduce ourselves; the peer binds our ID from the hop-1 copy
        let announcement = self.announcement();
        let message = self.originate(MessageType::Discovery, None, encode_payload(&announcement));
        if !self.transmit(peer, message) {
            debug!(peer = %peer, "Link unusable, dropping it");
            self.peers.remove(&peer);
            if self.peers.is_empty() {
                self.set_connection_state(ConnectionState::Listening);
            }
        }
    }

    fn on_link_disconnected(&mut self, peer: PeerHandle) {
        let Some(binding) = self.peers.remove(&peer) else {
            return;
        };
        debug!(peer = %peer, "Link down");

        if let Some(node_id) = binding {
            if self.peer_of.get(&node_id) == Some(&peer) {
                self.peer_of.remove(&node_id);
                self.topology.remove_local_link(&node_id);
                let affected = self.registry.link_lost(&node_id);
                info!(
                    node = %node_id,
                    invalidated = affected.len().saturating_sub(1),
                    "Direct link lost"
                );
                self.on_local_links_changed();
            }
        }

        if self.peers.is_empty() {
            self.set_connection_state(ConnectionState::Listening);
        }
    }

    /// Tell the mesh right away, so nobody keeps routing over a dead link
    fn on_local_links_changed(&mut self) {
        if !self.peers.is_empty() {
            self.advertise_topology();
        }
    }

    fn bind_peer(&mut self, peer: PeerHandle, message: &MeshMessage, now: Instant) {
        let source = message.source();
        match self.peers.get(&peer) {
            None => return,
            Some(Some(bound)) if *bound == source => {},
            Some(Some(bound)) => {
                warn!(peer = %peer, old = %bound, new = %source, "Link changed identity");
                let old = bound.clone();
                self.peer_of.remove(&old);
                self.topology.remove_local_link(&old);
                self.registry.link_lost(&old);
            },
            Some(None) => {
                debug!(peer = %peer, node = %source, "Link bound to node");
            },
        }

        self.peers.insert(peer, Some(source.clone()));
        self.peer_of.insert(source.clone(), peer);
        let added = self.topology.add_local_link(&source);
        let outcome = self.registry.link_established(
            &source,
            &message.sender_name,
            &message.sender_address,
            now,
        );
        self.note_join(source, outcome);
        if added {
            self.on_local_links_changed();
        }
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    fn on_frame(&mut self, peer: PeerHandle, bytes: &[u8]) {
        if !self.peers.contains_key(&peer) {
            // The transport may deliver a frame ahead of the link event
            debug!(peer = %peer, "Frame before link up, adopting link");
            self.on_link_connected(peer);
            if !self.peers.contains_key(&peer) {
                return;
            }
        }

        let message = match decode_frame(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed frame");
                return;
            },
        };
        let Some(message_id) = message.id() else {
            return;
        };
        let source = message.source();
        if source == self.local.node_id {
            debug!(message_id = %message_id, "Echo of own message dropped");
            return;
        }

        let now = Instant::now();
        if !self.seen.check_and_insert((message_id, source.clone()), now) {
            debug!(message_id = %message_id, source = %source, "Duplicate dropped");
            return;
        }

        if message.hop_count == 1 {
            self.bind_peer(peer, &message, now);
        }
        self.observe_origin(&message, now);

        let message_type = message.message_type();
        debug!(
            message_id = %message_id,
            source = %source,
            message_type = ?message_type,
            hop_count = message.hop_count,
            "Frame received"
        );

        match classify(&message, &self.local.node_id) {
            Disposition::Local => {
                self.handle_local(&message, peer);
            },
            Disposition::Broadcast => {
                if self.handle_local(&message, peer) {
                    self.relay_broadcast(&message, peer);
                }
            },
            Disposition::Relay(target) => self.relay_targeted(message, target),
        }
    }

    /// Refresh the origin's record from anything it sent
    fn observe_origin(&mut self, message: &MeshMessage, now: Instant) {
        let mut observation =
            Observation::new(message.source(), ObservationKind::Originated, now);
        match message.message_type() {
            MessageType::Discovery => {
                if let Ok(payload) =
                    decode_payload::<NodeAnnouncement>(MessageType::Discovery, &message.content)
                {
                    observation = observation.with_names(&payload.device_name, &payload.link_address);
                }
            },
            MessageType::Heartbeat => {
                if let Ok(payload) =
                    decode_payload::<HeartbeatPayload>(MessageType::Heartbeat, &message.content)
                {
                    observation = observation.with_names(&payload.device_name, &payload.link_address);
                }
            },
            _ if message.hop_count == 1 => {
                observation = observation.with_names(&message.sender_name, &message.sender_address);
            },
            _ => {},
        }
        self.observe(observation);
    }

    /// Handle a message addressed to us or broadcast
    ///
    /// Returns whether a broadcast should be relayed unchanged.
    fn handle_local(&mut self, message: &MeshMessage, peer: PeerHandle) -> bool {
        let message_type = message.message_type();
        let result = match message_type {
            MessageType::Chat => {
                self.deliver_chat(message);
                Ok(true)
            },
            MessageType::Discovery => self.on_announcement(message),
            MessageType::Topology => self.on_topology(message),
            MessageType::RouteRequest => self.on_route_request(message, peer).map(|_| false),
            MessageType::RouteReply => self.on_route_reply(message).map(|_| false),
            MessageType::Heartbeat => {
                self.registry
                    .record_heartbeat(&message.source(), message.timestamp, Instant::now());
                Ok(true)
            },
            MessageType::Unspecified => Ok(false),
        };

        match result {
            Ok(relay) => relay,
            Err(e) => {
                warn!(
                    source = %message.source(),
                    message_type = ?message_type,
                    error = %e,
                    "Dropping message with bad payload"
                );
                false
            },
        }
    }

    fn deliver_chat(&mut self, message: &MeshMessage) {
        let Some(message_id) = message.id() else {
            return;
        };
        self.events.dispatch(Event::ChatReceived {
            message_id,
            source: message.source(),
            target: message.target(),
            content: String::from_utf8_lossy(&message.content).into_owned(),
            hop_count: message.hop_count,
            sender_name: message.sender_name.clone(),
            timestamp: message.timestamp,
        });
    }

    fn on_announcement(&mut self, message: &MeshMessage) -> Result<bool, MeshError> {
        let payload: NodeAnnouncement =
            decode_payload(MessageType::Discovery, &message.content)?;
        self.apply_adjacency(&message.source(), &payload.neighbors, message.timestamp);
        Ok(true)
    }

    fn on_topology(&mut self, message: &MeshMessage) -> Result<bool, MeshError> {
        let payload: TopologyAdvertisement =
            decode_payload(MessageType::Topology, &message.content)?;

        if payload.request {
            if message.target().as_ref() == Some(&self.local.node_id) {
                debug!(requester = %message.source(), "Topology requested");
                self.advertise_topology();
            }
            return Ok(false);
        }

        self.apply_adjacency(&message.source(), &payload.neighbors, message.timestamp);
        Ok(true)
    }

    fn apply_adjacency(&mut self, node_id: &NodeId, neighbors: &[String], timestamp: u64) {
        let neighbors = node_ids(neighbors);
        if !self
            .topology
            .apply_topology_advertisement(node_id, neighbors.iter().cloned(), timestamp)
        {
            return;
        }

        let now = Instant::now();
        for neighbor in &neighbors {
            self.observe(Observation::new(
                neighbor.clone(),
                ObservationKind::Advertised,
                now,
            ));
        }
        let set: BTreeSet<NodeId> = neighbors
            .into_iter()
            .filter(|n| n != node_id)
            .collect();
        self.registry.set_connected_nodes(node_id, set);
    }

    fn on_route_request(&mut self, message: &MeshMessage, peer: PeerHandle) -> Result<(), MeshError> {
        let payload: RouteRequestPayload =
            decode_payload(MessageType::RouteRequest, &message.content)?;
        let origin = message.source();
        let target = NodeId::new(payload.target_node_id.clone());
        let now = Instant::now();

        if target.is_empty() || !self.discovery.note_request(payload.request_id, &origin, now) {
            return Ok(());
        }

        let mut walked = node_ids(&payload.path);
        if walked.first() != Some(&origin) || walked.contains(&self.local.node_id) {
            debug!(origin = %origin, "Route request with bad path dropped");
            return Ok(());
        }
        walked.push(self.local.node_id.clone());

        self.topology.record_path(&walked);
        for node in &walked {
            self.observe(Observation::new(node.clone(), ObservationKind::Advertised, now));
        }

        let table = self.routes.refresh(&mut self.registry, &self.topology);
        let answer = if target == self.local.node_id {
            Some(walked.clone())
        } else {
            table.path_to(&target).and_then(|tail| {
                let mut full = walked.clone();
                full.extend(tail.into_iter().skip(1));
                let hops = full.len().saturating_sub(1);
                (is_loop_free(&full) && hops <= self.config.max_hops as usize).then_some(full)
            })
        };

        match answer {
            Some(path) => {
                debug!(
                    origin = %origin,
                    target = %target,
                    request_id = payload.request_id,
                    hops = path.len() - 1,
                    "Answering route request"
                );
                let reply = RouteReplyPayload {
                    request_id: payload.request_id,
                    target_node_id: payload.target_node_id,
                    path: wire_ids(&path),
                };
                let reply =
                    self.originate(MessageType::RouteReply, Some(&origin), encode_payload(&reply));
                if let Err(e) = self.forward(reply) {
                    debug!(origin = %origin, error = %e, "Route reply not sent");
                }
            },
            None => {
                if !should_forward_message(message, self.config.max_hops) {
                    return Ok(());
                }
                let mut relayed = message.clone();
                relayed.content = encode_payload(&RouteRequestPayload {
                    request_id: payload.request_id,
                    target_node_id: payload.target_node_id,
                    path: wire_ids(&walked),
                });
                self.flood(&relayed, Some(peer));
            },
        }
        Ok(())
    }

    fn on_route_reply(&mut self, message: &MeshMessage) -> Result<(), MeshError> {
        let payload: RouteReplyPayload = decode_payload(MessageType::RouteReply, &message.content)?;
        let path = node_ids(&payload.path);
        if path.len() < 2 || !is_loop_free(&path) {
            debug!(source = %message.source(), "Route reply with bad path dropped");
            return Ok(());
        }

        self.topology.record_path(&path);
        let now = Instant::now();
        for node in &path {
            self.observe(Observation::new(node.clone(), ObservationKind::Advertised, now));
        }
        Ok(())
    }

    fn relay_broadcast(&mut self, message: &MeshMessage, arrived_on: PeerHandle) {
        if !should_forward_message(message, self.config.max_hops) {
            debug!(
                source = %message.source(),
                hop_count = message.hop_count,
                "Hop limit reached, not relaying"
            );
            return;
        }
        self.flood(message, Some(arrived_on));
    }

    fn relay_targeted(&mut self, message: MeshMessage, target: NodeId) {
        if message.message_type() == MessageType::RouteReply {
            if let Err(e) = self.on_route_reply(&message) {
                warn!(error = %e, "Dropping route reply with bad payload");
                return;
            }
        }

        if !should_forward_message(&message, self.config.max_hops) {
            debug!(
                target = %target,
                hop_count = message.hop_count,
                "Hop limit reached, not relaying"
            );
            return;
        }

        let table = self.routes.refresh(&mut self.registry, &self.topology);
        if table.route(&target).is_some() {
            if let Err(e) = self.forward(message) {
                debug!(target = %target, error = %e, "Relay failed");
            }
        } else {
            self.await_route(&target, QueuedMessage::relay(message));
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn send_chat(&mut self, target: Option<NodeId>, content: String, reply: Responder) {
        match target {
            None => {
                let message = self.originate(MessageType::Chat, None, content.into_bytes());
                let message_id = message.id();
                let peers = self.flood(&message, None);
                let result = message_id
                    .map(|message_id| SendOutcome::Broadcast { message_id, peers })
                    .ok_or_else(|| missing("message_id"));
                let _ = reply.send(result);
            },
            Some(target) => {
                let message = self.originate(MessageType::Chat, Some(&target), content.into_bytes());
                self.send_targeted(target, message, reply);
            },
        }
    }

    fn request_topology(&mut self, node_id: NodeId, reply: Responder) {
        let payload = TopologyAdvertisement {
            neighbors: Vec::new(),
            request: true,
        };
        let message =
            self.originate(MessageType::Topology, Some(&node_id), encode_payload(&payload));
        self.send_targeted(node_id, message, reply);
    }

    fn send_targeted(&mut self, target: NodeId, message: MeshMessage, reply: Responder) {
        if target == self.local.node_id {
            let _ = reply.send(Err(RoutingError::SelfTarget.into()));
            return;
        }

        let table = self.routes.refresh(&mut self.registry, &self.topology);
        if table.route(&target).is_some() {
            let _ = reply.send(self.forward(message));
        } else {
            self.await_route(&target, QueuedMessage::local(message, reply));
        }
    }

    /// Queue a message behind route discovery for `target`
    fn await_route(&mut self, target: &NodeId, queued: QueuedMessage) {
        if self.peers.is_empty() {
            self.no_route(target, queued);
            return;
        }

        if let Begin::Flood(request_id) = self.discovery.begin(target, Instant::now()) {
            debug!(target = %target, request_id, "Starting route discovery");
            let payload = RouteRequestPayload {
                request_id,
                target_node_id: target.as_str().to_string(),
                path: vec![self.local.node_id.as_str().to_string()],
            };
            self.discovery
                .note_request(request_id, &self.local.node_id, Instant::now());
            let request = self.originate(MessageType::RouteRequest, None, encode_payload(&payload));
            self.flood(&request, None);
        }

        if let Err(queued) = self.discovery.enqueue(target, queued) {
            debug!(target = %target, "Relay buffer full");
            self.no_route(target, queued);
        }
    }

    fn no_route(&self, target: &NodeId, queued: QueuedMessage) {
        let message = queued.respond(Err(RoutingError::NoRoute {
            target: target.clone(),
        }
        .into()));
        if message.source() != self.local.node_id {
            debug!(target = %target, source = %message.source(), "No route, relay dropped");
        }
    }

    /// Send a targeted message to the next hop of its route
    fn forward(&mut self, mut message: MeshMessage) -> Result<SendOutcome, MeshError> {
        let target = message.target().ok_or_else(|| missing("target_node_id"))?;
        let table = self.routes.refresh(&mut self.registry, &self.topology);
        let route = table
            .route(&target)
            .cloned()
            .ok_or_else(|| RoutingError::NoRoute {
                target: target.clone(),
            })?;
        let peer = *self
            .peer_of
            .get(&route.next_hop)
            .ok_or_else(|| RoutingError::PeerUnreachable {
                node_id: route.next_hop.clone(),
            })?;

        stamp_for_transmit(&mut message, &self.local, self.config.max_hops)?;
        let frame = encode_frame(&message)?;
        self.transport.send_frame(peer, frame).map_err(|e| {
            warn!(peer = %peer, error = %e, "Transport send failed");
            MeshError::from(e)
        })?;

        let message_id = message.id().ok_or_else(|| missing("message_id"))?;
        Ok(SendOutcome::Forwarded {
            message_id,
            next_hop: route.next_hop,
            hop_distance: route.hop_distance,
        })
    }

    /// Send one copy to every link except `except`
    fn flood(&mut self, message: &MeshMessage, except: Option<PeerHandle>) -> usize {
        let mut copy = message.clone();
        if let Err(e) = stamp_for_transmit(&mut copy, &self.local, self.config.max_hops) {
            debug!(error = %e, "Not flooding");
            return 0;
        }
        let frame = match encode_frame(&copy) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return 0;
            },
        };

        let mut sent = 0;
        for peer in self.peers.keys().copied().filter(|p| Some(*p) != except) {
            match self.transport.send_frame(peer, frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer, error = %e, "Transport send failed"),
            }
        }
        sent
    }

    /// Send one copy on a single link
    ///
    /// Returns whether the transport accepted it.
    fn transmit(&mut self, peer: PeerHandle, mut message: MeshMessage) -> bool {
        if stamp_for_transmit(&mut message, &self.local, self.config.max_hops).is_err() {
            return false;
        }
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return false;
            },
        };
        match self.transport.send_frame(peer, frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Transport send failed");
                false
            },
        }
    }

    /// Create a message originated by this node, already marked as seen
    fn originate(
        &mut self,
        message_type: MessageType,
        target: Option<&NodeId>,
        content: Vec<u8>,
    ) -> MeshMessage {
        self.sequence += 1;
        let timestamp = self.clock.next_stamp();
        let message_id = MessageId::generate(&self.local.node_id, self.sequence, timestamp);
        self.seen.check_and_insert(
            (message_id, self.local.node_id.clone()),
            Instant::now(),
        );
        MeshMessage::new(
            message_id,
            message_type,
            &self.local.node_id,
            target,
            content,
            timestamp,
        )
    }

    fn announcement(&self) -> NodeAnnouncement {
        NodeAnnouncement {
            device_name: self.local.device_name.clone(),
            link_address: self.local.link_address.clone(),
            neighbors: wire_ids(self.topology.local_links()),
        }
    }

    fn advertise_topology(&mut self) {
        let payload = TopologyAdvertisement {
            neighbors: wire_ids(self.topology.local_links()),
            request: false,
        };
        let message = self.originate(MessageType::Topology, None, encode_payload(&payload));
        self.flood(&message, None);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn on_heartbeat_tick(&mut self) {
        let payload = HeartbeatMonitor::payload(&self.local);
        let message = self.originate(MessageType::Heartbeat, None, encode_payload(&payload));
        self.flood(&message, None);

        let now = Instant::now();
        let report = self
            .heartbeat
            .sweep(&mut self.registry, &mut self.topology, now);
        for node_id in &report.timed_out {
            info!(node = %node_id, "Node stopped answering heartbeats");
        }
        let mut unbound = false;
        for record in report.evicted {
            if let Some(peer) = self.peer_of.remove(&record.node_id) {
                self.peers.insert(peer, None);
                unbound = true;
            }
            info!(node = %record.node_id, "Node evicted");
            self.events.dispatch(Event::NodeLeft {
                node_id: record.node_id,
            });
        }
        if unbound {
            self.on_local_links_changed();
        }
        self.seen.expire(now);
    }

    fn on_topology_tick(&mut self) {
        if !self.peers.is_empty() {
            self.advertise_topology();
        }
    }

    fn on_discovery_deadline(&mut self) {
        for pending in self.discovery.take_expired(Instant::now()) {
            self.fail_pending(pending, DiscoveryState::TimedOut);
        }
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn observe(&mut self, observation: Observation) {
        let node_id = observation.node_id.clone();
        let outcome = self.registry.upsert(observation);
        self.note_join(node_id, outcome);
    }

    fn note_join(&mut self, node_id: NodeId, outcome: UpsertOutcome) {
        if outcome == UpsertOutcome::Inserted {
            let device_name = self
                .registry
                .get(&node_id)
                .map(|n| n.device_name.clone())
                .unwrap_or_default();
            info!(node = %node_id, "Node joined");
            self.events.dispatch(Event::NodeJoined {
                node_id,
                device_name,
            });
        }
    }

    fn flush_resolved(&mut self, pending: PendingRequest, table: &RouteTable) {
        let Some(route) = table.route(&pending.target).cloned() else {
            return;
        };
        info!(
            target = %pending.target,
            next_hop = %route.next_hop,
            hop_distance = route.hop_distance,
            elapsed_ms = pending.started.elapsed().as_millis() as u64,
            "Route resolved"
        );
        self.events.dispatch(Event::RouteResolved {
            target: pending.target.clone(),
            next_hop: route.next_hop.clone(),
            hop_distance: route.hop_distance,
        });

        for queued in pending.queued {
            let result = self.forward(queued.message.clone());
            if let Err(e) = &result {
                debug!(target = %pending.target, error = %e, "Queued send failed");
            }
            queued.respond(result);
        }
    }

    fn fail_pending(&mut self, pending: PendingRequest, state: DiscoveryState) {
        info!(
            target = %pending.target,
            request_id = pending.request_id,
            state = ?state,
            dropped = pending.queued.len(),
            "Route discovery failed"
        );
        self.events.dispatch(Event::RouteFailed {
            target: pending.target.clone(),
            state,
        });
        for queued in pending.queued {
            self.no_route(&pending.target, queued);
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        if self.connection_state != state {
            self.connection_state = state;
            self.events.dispatch(Event::ConnectionStateChanged(state));
        }
    }

    /// Bring derived state up to date and publish it
    fn settle(&mut self) {
        let table = self.routes.refresh(&mut self.registry, &self.topology);

        for pending in self.discovery.take_resolved(&table) {
            self.flush_resolved(pending, &table);
        }
        for pending in self.discovery.take_abandoned() {
            self.fail_pending(pending, DiscoveryState::Cancelled);
        }

        for change in self.registry.drain_status_changes() {
            debug!(node = %change.node_id, from = ?change.from, to = ?change.to, "Status changed");
            self.events.dispatch(Event::NodeStatusChanged {
                node_id: change.node_id,
                from: change.from,
                to: change.to,
            });
        }

        let routes_changed = match &self.last_routes {
            Some(previous) => {
                !Arc::ptr_eq(previous, &table) && !previous.routes().eq(table.routes())
            },
            None => !table.is_empty(),
        };
        if routes_changed {
            self.events.dispatch(Event::TopologyChanged {
                known: self.registry.len(),
                reachable: table.len(),
            });
        }
        self.last_routes = Some(Arc::clone(&table));

        self.publish(&table);
    }

    fn publish(&mut self, table: &RouteTable) {
        let key = (
            self.registry.generation(),
            self.topology.generation(),
            self.discovery.generation(),
            self.peers.len(),
            self.connection_state,
        );
        if self.published == Some(key) {
            return;
        }
        self.published = Some(key);

        let snapshot = MeshSnapshot {
            local: self.local.node_id.clone(),
            device_name: self.local.device_name.clone(),
            connection_state: self.connection_state,
            nodes: self.registry.all().cloned().collect(),
            routes: table.routes().cloned().collect(),
            links: self.peers.len(),
            pending_discoveries: self.discovery.pending_count(),
            discoveries: self.discovery.states(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    fn shutdown(&mut self) {
        for pending in self.discovery.clear() {
            for queued in pending.queued {
                queued.respond(Err(MeshError::NotRunning));
            }
        }
        let peers: Vec<PeerHandle> = self.peers.keys().copied().collect();
        for peer in peers {
            self.transport.close_link(peer);
        }

        self.peers.clear();
        self.peer_of.clear();
        self.registry.clear();
        self.topology.clear();
        self.routes.invalidate();
        self.seen.clear();
        self.registry.drain_status_changes();
        self.set_connection_state(ConnectionState::Idle);

        let table = self.routes.refresh(&mut self.registry, &self.topology);
        self.publish(&table);
    }
}

fn missing(field: &'static str) -> MeshError {
    ProtocolError::MissingField { field }.into()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(PeerHandle, MeshMessage)>>,
        closed: Mutex<Vec<PeerHandle>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<(PeerHandle, MeshMessage)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Transport for RecordingTransport {
        fn send_frame(
            &self,
            peer: PeerHandle,
            frame: Vec<u8>,
        ) -> std::result::Result<(), TransportError> {
            let message = decode_frame(&frame).map_err(|e| TransportError::SendFailed {
                peer,
                reason: e.to_string(),
            })?;
            self.sent.lock().push((peer, message));
            Ok(())
        }

        fn close_link(&self, peer: PeerHandle) {
            self.closed.lock().push(peer);
        }
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn router_with(
        local: &str,
        config: MeshConfig,
    ) -> (MeshRouter, Arc<RecordingTransport>, EventHandlers) {
        let transport = Arc::new(RecordingTransport::default());
        let events = EventHandlers::new();
        let identity = LocalIdentity {
            node_id: id(local),
            device_name: format!("{} phone", local),
            link_address: "00:00:00:00:00:0B".to_string(),
        };
        let (tx, _rx) = watch::channel(Arc::new(MeshSnapshot::empty(
            identity.node_id.clone(),
            identity.device_name.clone(),
        )));
        let router = MeshRouter::new(
            identity,
            config,
            transport.clone(),
            events.clone(),
            Arc::new(tx),
        );
        (router, transport, events)
    }

    fn router(local: &str) -> (MeshRouter, Arc<RecordingTransport>, EventHandlers) {
        router_with(local, MeshConfig::default())
    }

    /// A frame as it arrives on a link
    fn frame(
        source: &str,
        target: Option<&str>,
        message_type: MessageType,
        content: Vec<u8>,
        hop_count: u32,
        sequence: u64,
    ) -> Vec<u8> {
        let source = id(source);
        let target = target.map(id);
        let mut message = MeshMessage::new(
            MessageId::generate(&source, sequence, 1_000 + sequence),
            message_type,
            &source,
            target.as_ref(),
            content,
            1_000 + sequence,
        );
        message.hop_count = hop_count;
        message.sender_name = format!("{} phone", source);
        encode_frame(&message).unwrap()
    }

    fn connect(router: &mut MeshRouter, peer: u64) -> PeerHandle {
        let peer = PeerHandle::new(peer);
        router.handle_command(Command::Link(LinkEvent::Connected(peer)));
        peer
    }

    /// Connect and bind a peer to `node` through its hop-1 announcement
    fn link(router: &mut MeshRouter, peer: u64, node: &str, neighbors: &[&str]) -> PeerHandle {
        let handle = connect(router, peer);
        let announcement = NodeAnnouncement {
            device_name: format!("{} phone", node),
            link_address: String::new(),
            neighbors: neighbors.iter().map(|n| n.to_string()).collect(),
        };
        let bytes = frame(
            node,
            None,
            MessageType::Discovery,
            encode_payload(&announcement),
            1,
            peer * 100,
        );
        router.on_frame(handle, &bytes);
        router.settle();
        handle
    }

    fn count_chats(events: &EventHandlers) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        events.subscribe(move |event| {
            if let Event::ChatReceived { .. } = event {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[test]
    fn test_new_link_receives_announcement() {
        let (mut router, transport, _) = router("B");
        let peer = connect(&mut router, 1);

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (to, message) = &sent[0];
        assert_eq!(*to, peer);
        assert_eq!(message.message_type(), MessageType::Discovery);
        assert_eq!(message.source(), id("B"));
        assert_eq!(message.hop_count, 1);
        assert_eq!(router.connection_state, ConnectionState::Connected);
    }

    #[test]
    fn test_connection_cap_closes_extra_links() {
        let config = MeshConfig {
            max_connections: 1,
            ..MeshConfig::default()
        };
        let (mut router, transport, _) = router_with("B", config);
        connect(&mut router, 1);
        connect(&mut router, 2);

        assert_eq!(router.peers.len(), 1);
        assert_eq!(*transport.closed.lock(), vec![PeerHandle::new(2)]);
    }

    #[test]
    fn test_hop_one_frame_binds_peer() {
        let (mut router, _, _) = router("B");
        let peer = link(&mut router, 1, "A", &["B"]);

        assert_eq!(router.peer_of.get(&id("A")), Some(&peer));
        let record = router.registry.get(&id("A")).unwrap();
        assert!(record.directly_connected);
        assert_eq!(record.hop_distance, Some(1));
        assert_eq!(record.device_name, "A phone");
    }

    #[test]
    fn test_duplicate_broadcast_delivered_once() {
        let (mut router, transport, events) = router("B");
        let chats = count_chats(&events);
        let a = link(&mut router, 1, "A", &["B"]);
        let c = link(&mut router, 2, "C", &["B"]);
        transport.take();

        let bytes = frame("A", None, MessageType::Chat, b"hello".to_vec(), 1, 7);
        router.on_frame(a, &bytes);
        router.on_frame(a, &bytes);
        router.on_frame(c, &bytes);

        assert_eq!(chats.load(Ordering::SeqCst), 1);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c);
        assert_eq!(sent[0].1.hop_count, 2);
        assert_eq!(sent[0].1.sender_name, "B phone");
    }

    #[test]
    fn test_broadcast_at_hop_limit_not_relayed() {
        let config = MeshConfig {
            max_hops: 2,
            ..MeshConfig::default()
        };
        let (mut router, transport, events) = router_with("B", config);
        let chats = count_chats(&events);
        let a = link(&mut router, 1, "A", &["B"]);
        link(&mut router, 2, "C", &["B"]);
        transport.take();

        router.on_frame(a, &frame("X", None, MessageType::Chat, b"far".to_vec(), 2, 1));

        assert_eq!(chats.load(Ordering::SeqCst), 1);
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_own_echo_dropped() {
        let (mut router, transport, events) = router("B");
        let chats = count_chats(&events);
        let a = link(&mut router, 1, "A", &["B"]);
        transport.take();

        router.on_frame(a, &frame("B", None, MessageType::Chat, b"me".to_vec(), 2, 1));

        assert_eq!(chats.load(Ordering::SeqCst), 0);
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let (mut router, transport, events) = router("B");
        let chats = count_chats(&events);
        let a = link(&mut router, 1, "A", &["B"]);
        transport.take();

        router.on_frame(a, &[0xff, 0x01, 0x02]);

        assert_eq!(chats.load(Ordering::SeqCst), 0);
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_frame_before_link_event_adopts_link() {
        let (mut router, transport, events) = router("B");
        let chats = count_chats(&events);
        let peer = PeerHandle::new(42);

        router.on_frame(peer, &frame("A", None, MessageType::Chat, b"early".to_vec(), 1, 3));

        assert_eq!(chats.load(Ordering::SeqCst), 1);
        assert_eq!(router.peer_of.get(&id("A")), Some(&peer));
        let sent = transport.take();
        assert_eq!(sent[0].0, peer);
        assert_eq!(sent[0].1.message_type(), MessageType::Discovery);
    }

    #[test]
    fn test_link_change_is_advertised() {
        let (mut router, transport, _) = router("B");
        let a = link(&mut router, 1, "A", &["B"]);
        let c = link(&mut router, 2, "C", &["B"]);
        transport.take();

        router.handle_command(Command::Link(LinkEvent::Disconnected(c)));

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (to, advert) = &sent[0];
        assert_eq!(*to, a);
        assert_eq!(advert.message_type(), MessageType::Topology);
        let payload: TopologyAdvertisement =
            decode_payload(MessageType::Topology, &advert.content).unwrap();
        assert!(!payload.request);
        assert_eq!(payload.neighbors, vec!["A".to_string()]);
    }

    #[test]
    fn test_route_reply_releases_queued_send() {
        let (mut router, transport, events) = router("A");
        let resolved = Arc::new(Mutex::new(Vec::new()));
        let resolved_clone = Arc::clone(&resolved);
        events.subscribe(move |event| {
            if let Event::RouteResolved { target, next_hop, hop_distance } = event {
                resolved_clone.lock().push((target, next_hop, hop_distance));
            }
        });
        let b = link(&mut router, 1, "B", &["A"]);
        transport.take();

        let (tx, mut rx) = oneshot::channel();
        router.handle_command(Command::SendChat {
            target: Some(id("C")),
            content: "via B".to_string(),
            reply: tx,
        });
        router.settle();
        let request = transport.take();
        assert_eq!(request[0].1.message_type(), MessageType::RouteRequest);
        let request: RouteRequestPayload =
            decode_payload(MessageType::RouteRequest, &request[0].1.content).unwrap();
        assert_eq!(router.discovery.state(&id("C")), DiscoveryState::RequestSent);

        let reply = RouteReplyPayload {
            request_id: request.request_id,
            target_node_id: "C".to_string(),
            path: vec!["A".to_string(), "B".to_string(), "C".to_string()],
        };
        router.on_frame(
            b,
            &frame("C", Some("A"), MessageType::RouteReply, encode_payload(&reply), 2, 4),
        );
        router.settle();

        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            SendOutcome::Forwarded {
                message_id: router_sent_chat_id(&transport),
                next_hop: id("B"),
                hop_distance: 2,
            }
        );
        assert_eq!(*resolved.lock(), vec![(id("C"), id("B"), 2)]);
        assert_eq!(router.discovery.state(&id("C")), DiscoveryState::ReplyReceived);
        let snapshot = router.snapshots.borrow().clone();
        assert_eq!(snapshot.discovery_state(&id("C")), DiscoveryState::ReplyReceived);
    }

    fn router_sent_chat_id(transport: &RecordingTransport) -> MessageId {
        let sent = transport.take();
        let (_, chat) = sent
            .iter()
            .find(|(_, m)| m.message_type() == MessageType::Chat)
            .unwrap();
        chat.id().unwrap()
    }

    #[test]
    fn test_route_request_answered_by_target() {
        let (mut router, transport, _) = router("B");
        let a = link(&mut router, 1, "A", &["B"]);
        transport.take();

        let request = RouteRequestPayload {
            request_id: 9,
            target_node_id: "B".to_string(),
            path: vec!["A".to_string()],
        };
        router.on_frame(
            a,
            &frame("A", None, MessageType::RouteRequest, encode_payload(&request), 1, 5),
        );

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (to, reply) = &sent[0];
        assert_eq!(*to, a);
        assert_eq!(reply.message_type(), MessageType::RouteReply);
        assert_eq!(reply.target(), Some(id("A")));
        let payload: RouteReplyPayload =
            decode_payload(MessageType::RouteReply, &reply.content).unwrap();
        assert_eq!(payload.path, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_route_request_answered_by_relay_with_route() {
        let (mut router, transport, _) = router("B");
        let a = link(&mut router, 1, "A", &["B"]);
        link(&mut router, 2, "C", &["B"]);
        transport.take();

        let request = RouteRequestPayload {
            request_id: 4,
            target_node_id: "C".to_string(),
            path: vec!["A".to_string()],
        };
        router.on_frame(
            a,
            &frame("A", None, MessageType::RouteRequest, encode_payload(&request), 1, 5),
        );

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let payload: RouteReplyPayload =
            decode_payload(MessageType::RouteReply, &sent[0].1.content).unwrap();
        assert_eq!(payload.path, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_route_request_reflooded_when_unknown() {
        let (mut router, transport, _) = router("B");
        let a = link(&mut router, 1, "A", &["B"]);
        let c = link(&mut router, 2, "C", &["B"]);
        transport.take();

        let request = RouteRequestPayload {
            request_id: 4,
            target_node_id: "Z".to_string(),
            path: vec!["A".to_string()],
        };
        let bytes = frame("A", None, MessageType::RouteRequest, encode_payload(&request), 1, 5);
        router.on_frame(a, &bytes);

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c);
        let payload: RouteRequestPayload =
            decode_payload(MessageType::RouteRequest, &sent[0].1.content).unwrap();
        assert_eq!(payload.path, vec!["A", "B"]);
    }

    #[test]
    fn test_relay_to_known_target() {
        let (mut router, transport, events) = router("B");
        let chats = count_chats(&events);
        let a = link(&mut router, 1, "A", &["B"]);
        let c = link(&mut router, 2, "C", &["B"]);
        transport.take();

        router.on_frame(a, &frame("A", Some("C"), MessageType::Chat, b"hi".to_vec(), 1, 8));

        assert_eq!(chats.load(Ordering::SeqCst), 0);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c);
        assert_eq!(sent[0].1.hop_count, 2);
        assert_eq!(sent[0].1.source(), id("A"));
    }

    #[test]
    fn test_send_to_self_rejected() {
        let (mut router, _, _) = router("B");
        let (tx, mut rx) = oneshot::channel();
        router.handle_command(Command::SendChat {
            target: Some(id("B")),
            content: "me".to_string(),
            reply: tx,
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(MeshError::Routing(RoutingError::SelfTarget))
        );
    }

    #[test]
    fn test_send_without_links_fails_fast() {
        let (mut router, _, _) = router("B");
        let (tx, mut rx) = oneshot::channel();
        router.handle_command(Command::SendChat {
            target: Some(id("Z")),
            content: "hello?".to_string(),
            reply: tx,
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(MeshError::Routing(RoutingError::NoRoute { target: id("Z") }))
        );
        assert_eq!(router.discovery.pending_count(), 0);
    }

    #[test]
    fn test_unknown_target_queues_behind_discovery() {
        let (mut router, transport, _) = router("B");
        link(&mut router, 1, "A", &["B"]);
        transport.take();

        let (tx, mut rx) = oneshot::channel();
        router.handle_command(Command::SendChat {
            target: Some(id("Z")),
            content: "later".to_string(),
            reply: tx,
        });

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.message_type(), MessageType::RouteRequest);
        assert!(rx.try_recv().is_err());
        assert_eq!(router.discovery.state(&id("Z")), DiscoveryState::RequestSent);

        let (tx, rx) = oneshot::channel();
        router.handle_command(Command::CancelDiscovery {
            target: id("Z"),
            reply: tx,
        });
        assert!(matches!(rx.blocking_recv(), Ok(true)));
    }

    #[test]
    fn test_broadcast_reports_peer_count() {
        let (mut router, transport, _) = router("B");
        link(&mut router, 1, "A", &["B"]);
        link(&mut router, 2, "C", &["B"]);
        transport.take();

        let (tx, mut rx) = oneshot::channel();
        router.handle_command(Command::SendChat {
            target: None,
            content: "all".to_string(),
            reply: tx,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            Ok(SendOutcome::Broadcast { peers: 2, .. })
        ));
    }

    #[test]
    fn test_link_loss_unbinds_peer() {
        let (mut router, _, _) = router("B");
        let a = link(&mut router, 1, "A", &["B"]);

        router.handle_command(Command::Link(LinkEvent::Disconnected(a)));
        router.settle();

        assert!(router.peer_of.is_empty());
        assert_eq!(router.connection_state, ConnectionState::Listening);
        let record = router.registry.get(&id("A")).unwrap();
        assert!(!record.directly_connected);
        assert_eq!(record.hop_distance, None);
    }

    #[test]
    fn test_settle_publishes_snapshot() {
        let (mut router, _, _) = router("B");
        let mut rx = router.snapshots.subscribe();
        link(&mut router, 1, "A", &["B"]);

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.links, 1);
        assert!(snapshot.node(&id("A")).is_some());
        assert_eq!(snapshot.routes.len(), 1);
    }
}
