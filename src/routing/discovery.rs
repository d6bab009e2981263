//! On-demand route discovery
//!
//! A send to a node with no known route floods a `RouteRequest`. Relays
//! re-flood it once, appending themselves to the request path, unless they
//! are the target or already hold a loop-free route to it; those answer
//! with a `RouteReply` carrying the full requester-to-target path.
//!
//! Each outstanding resolution moves through
//! `Idle -> RequestSent -> {ReplyReceived | TimedOut | Cancelled}`.
//! Reaching a terminal state releases the pending record together with
//! every message queued behind it; the terminal state itself is kept in a
//! short history until the next request for the same target.

use crate::error::MeshError;
use crate::protocol::{MeshMessage, NodeId};
use crate::routing::dedup::SeenCache;
use crate::routing::router::SendOutcome;
use crate::routing::routing_table::RouteTable;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Terminal outcomes remembered for snapshots
const OUTCOME_HISTORY: usize = 64;

/// Channel a waiting caller receives its send result on
pub type Responder = oneshot::Sender<Result<SendOutcome, MeshError>>;

/// Lifecycle of one route resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No request outstanding
    Idle,
    /// Request flooded, waiting for a reply
    RequestSent,
    /// A route to the target became known
    ReplyReceived,
    /// No reply within the discovery timeout
    TimedOut,
    /// Cancelled by the caller, or every waiting caller went away
    Cancelled,
}

/// A message waiting for a route
#[derive(Debug)]
pub struct QueuedMessage {
    /// Message as it will be transmitted, not yet stamped
    pub message: MeshMessage,
    /// Caller waiting on the outcome; `None` for relayed traffic
    pub responder: Option<Responder>,
}

impl QueuedMessage {
    /// A locally originated send
    pub fn local(message: MeshMessage, responder: Responder) -> Self {
        Self {
            message,
            responder: Some(responder),
        }
    }

    /// A message being relayed for another node
    pub fn relay(message: MeshMessage) -> Self {
        Self {
            message,
            responder: None,
        }
    }

    fn abandoned(&self) -> bool {
        self.responder.as_ref().is_some_and(|r| r.is_closed())
    }

    /// Report the outcome to the waiting caller, if any
    pub fn respond(self, result: Result<SendOutcome, MeshError>) -> MeshMessage {
        if let Some(responder) = self.responder {
            let _ = responder.send(result);
        }
        self.message
    }
}

/// An outstanding resolution
#[derive(Debug)]
pub struct PendingRequest {
    /// Node being resolved
    pub target: NodeId,
    /// Identifier flooded in the request
    pub request_id: u64,
    /// When the request was flooded
    pub started: Instant,
    /// When the request times out
    pub deadline: Instant,
    /// Messages waiting for the route
    pub queued: Vec<QueuedMessage>,
    relays: usize,
}

impl PendingRequest {
    /// Number of queued messages with a waiting caller
    pub fn waiters(&self) -> usize {
        self.queued.iter().filter(|q| q.responder.is_some()).count()
    }
}

/// Result of [`Discovery::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// A new request must be flooded with this ID
    Flood(u64),
    /// A request for this target is already outstanding
    Joined(u64),
}

/// Pending route requests and the recent-request window
#[derive(Debug)]
pub struct Discovery {
    pending: HashMap<NodeId, PendingRequest>,
    outcomes: VecDeque<(NodeId, DiscoveryState)>,
    recent: SeenCache<(u64, NodeId)>,
    generation: u64,
    next_request_id: u64,
    timeout: Duration,
    relay_buffer_limit: usize,
}

impl Discovery {
    /// Create the discovery state
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long a request waits for a reply
    /// * `request_window` - How long `(request_id, origin)` pairs are remembered
    /// * `request_capacity` - Maximum remembered pairs
    /// * `relay_buffer_limit` - Relayed messages queued per pending request
    pub fn new(
        timeout: Duration,
        request_window: Duration,
        request_capacity: usize,
        relay_buffer_limit: usize,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            outcomes: VecDeque::new(),
            recent: SeenCache::new(request_window, request_capacity),
            generation: 0,
            next_request_id: rand::random::<u32>() as u64,
            timeout,
            relay_buffer_limit,
        }
    }

    /// Start resolving `target`, or join the request already outstanding
    pub fn begin(&mut self, target: &NodeId, now: Instant) -> Begin {
        if let Some(pending) = self.pending.get(target) {
            return Begin::Joined(pending.request_id);
        }

        self.next_request_id = self.next_request_id.wrapping_add(1);
        let request_id = self.next_request_id;
        self.outcomes.retain(|(t, _)| t != target);
        self.generation += 1;
        self.pending.insert(
            target.clone(),
            PendingRequest {
                target: target.clone(),
                request_id,
                started: now,
                deadline: now + self.timeout,
                queued: Vec::new(),
                relays: 0,
            },
        );
        Begin::Flood(request_id)
    }

    /// Queue a message behind the pending request for `target`
    ///
    /// Returns the message back when nothing is pending for the target or
    /// the relay buffer is full.
    pub fn enqueue(&mut self, target: &NodeId, queued: QueuedMessage) -> Result<(), QueuedMessage> {
        let Some(pending) = self.pending.get_mut(target) else {
            return Err(queued);
        };
        if queued.responder.is_none() {
            if pending.relays >= self.relay_buffer_limit {
                return Err(queued);
            }
            pending.relays += 1;
        }
        pending.queued.push(queued);
        Ok(())
    }

    /// State of the resolution for `target`
    ///
    /// A released request reports its terminal state until a new request
    /// for the same target starts or the history overflows.
    pub fn state(&self, target: &NodeId) -> DiscoveryState {
        if self.pending.contains_key(target) {
            return DiscoveryState::RequestSent;
        }
        self.outcomes
            .iter()
            .rev()
            .find(|(t, _)| t == target)
            .map(|(_, state)| *state)
            .unwrap_or(DiscoveryState::Idle)
    }

    /// Every tracked resolution, ordered by target
    pub fn states(&self) -> Vec<(NodeId, DiscoveryState)> {
        let mut states: Vec<(NodeId, DiscoveryState)> = self
            .pending
            .keys()
            .map(|t| (t.clone(), DiscoveryState::RequestSent))
            .chain(self.outcomes.iter().cloned())
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Mutation counter, bumped whenever a state changes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn finish(&mut self, targets: Vec<NodeId>, state: DiscoveryState) -> Vec<PendingRequest> {
        let released: Vec<PendingRequest> = targets
            .iter()
            .filter_map(|target| self.pending.remove(target))
            .collect();
        for pending in &released {
            self.outcomes.push_back((pending.target.clone(), state));
            if self.outcomes.len() > OUTCOME_HISTORY {
                self.outcomes.pop_front();
            }
        }
        if !released.is_empty() {
            self.generation += 1;
        }
        released
    }

    /// Remember a request seen on the wire
    ///
    /// Returns `false` if `(request_id, origin)` was already seen inside the
    /// window.
    pub fn note_request(&mut self, request_id: u64, origin: &NodeId, now: Instant) -> bool {
        self.recent.check_and_insert((request_id, origin.clone()), now)
    }

    /// Release every request whose target the table can now reach
    pub fn take_resolved(&mut self, table: &RouteTable) -> Vec<PendingRequest> {
        let targets: Vec<NodeId> = self
            .pending
            .keys()
            .filter(|target| table.route(target).is_some())
            .cloned()
            .collect();
        self.finish(targets, DiscoveryState::ReplyReceived)
    }

    /// Release every request past its deadline
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let targets: Vec<NodeId> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.target.clone())
            .collect();
        self.finish(targets, DiscoveryState::TimedOut)
    }

    /// Release every request left with nothing to deliver
    ///
    /// Queued sends whose caller dropped the future are discarded first; a
    /// request with an empty queue afterwards is cancelled.
    pub fn take_abandoned(&mut self) -> Vec<PendingRequest> {
        let mut abandoned = Vec::new();
        for pending in self.pending.values_mut() {
            let before = pending.queued.len();
            pending.queued.retain(|q| !q.abandoned());
            if before > 0 && pending.queued.is_empty() {
                abandoned.push(pending.target.clone());
            }
        }
        self.finish(abandoned, DiscoveryState::Cancelled)
    }

    /// Cancel the request for `target`
    pub fn cancel(&mut self, target: &NodeId) -> Option<PendingRequest> {
        self.finish(vec![target.clone()], DiscoveryState::Cancelled).pop()
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Number of pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all state, returning the pending requests
    pub fn clear(&mut self) -> Vec<PendingRequest> {
        self.recent.clear();
        self.outcomes.clear();
        self.generation += 1;
        self.pending.drain().map(|(_, p)| p).collect()
    }
}
