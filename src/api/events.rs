//! Event system for asynchronous notifications
//!
//! This module defines the event types and event handler mechanism that
//! allows applications to learn about received chat messages, nodes joining
//! and leaving, topology changes and route discovery results.

use crate::protocol::{MessageId, NodeId};
use crate::routing::{DiscoveryState, NodeStatus};
use crate::transport::ConnectionState;
use parking_lot::RwLock;
use std::sync::Arc;

/// Events that can be delivered to application handlers
#[derive(Debug, Clone)]
pub enum Event {
    /// A chat message addressed to this node, or broadcast, arrived
    ChatReceived {
        /// Unique identifier for this message
        message_id: MessageId,
        /// Originating node
        source: NodeId,
        /// Destination, `None` for broadcast
        target: Option<NodeId>,
        /// Message text
        content: String,
        /// Links the message crossed
        hop_count: u32,
        /// Display name of the node that handed us the message
        sender_name: String,
        /// Origin wall clock in milliseconds
        timestamp: u64,
    },

    /// A node was observed for the first time
    NodeJoined {
        /// The new node
        node_id: NodeId,
        /// Its display name, if known yet
        device_name: String,
    },

    /// A node was evicted after staying unreachable
    NodeLeft {
        /// The forgotten node
        node_id: NodeId,
    },

    /// A node's believed status changed
    NodeStatusChanged {
        /// The node
        node_id: NodeId,
        /// Previous status
        from: NodeStatus,
        /// New status
        to: NodeStatus,
    },

    /// The set of reachable nodes or their routes changed
    TopologyChanged {
        /// Known nodes
        known: usize,
        /// Nodes with a route
        reachable: usize,
    },

    /// Link-level state of this device changed
    ConnectionStateChanged(ConnectionState),

    /// Route discovery found a path
    RouteResolved {
        /// Resolved node
        target: NodeId,
        /// Direct neighbor to send through
        next_hop: NodeId,
        /// Hops to the target
        hop_distance: u32,
    },

    /// Route discovery ended without a path
    RouteFailed {
        /// Node that could not be resolved
        target: NodeId,
        /// `TimedOut` or `Cancelled`
        state: DiscoveryState,
    },

    /// Node has started successfully
    NodeStarted,

    /// Node has stopped
    NodeStopped,
}

/// Handle for unsubscribing from events
///
/// When dropped, the associated event handler will NOT be automatically
/// unsubscribed. You must explicitly call `MeshNode::unsubscribe()` to
/// remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Type alias for event handler callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Manages event subscriptions and delivery
///
/// Cheap to clone; clones share the same subscriber list, so the router
/// task dispatches to handlers registered on the node handle.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<RwLock<u64>>,
}

impl EventHandlers {
    /// Create a new event handler registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler
    ///
    /// The handler will be called for all future events until unsubscribed.
    ///
    /// # Arguments
    ///
    /// * `callback` - The callback function to invoke for events
    ///
    /// # Returns
    ///
    /// A `SubscriptionHandle` that can be used to unsubscribe later.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.write();
        let handle = SubscriptionHandle::new(*next_id);
        *next_id += 1;

        self.handlers.write().push((handle, Arc::new(callback)));
        handle
    }

    /// Unsubscribe an event handler
    ///
    /// If the handle is not found, this is a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Dispatch an event to all registered handlers
    ///
    /// Handlers are called in the order they were registered. If a handler
    /// panics, the panic is caught and logged, and the remaining handlers
    /// still run.
    pub fn dispatch(&self, event: Event) {
        // Snapshot so a handler may subscribe or unsubscribe re-entrantly
        let handlers: Vec<(SubscriptionHandle, EventCallback)> = self.handlers.read().clone();

        for (handle, callback) in handlers {
            let event_clone = event.clone();

            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            })) {
                tracing::error!(
                    handler = ?handle,
                    "Event handler panicked: {}",
                    e.downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                );
            }
        }
    }

    /// Get the number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_event_handlers_subscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let _handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.dispatch(Event::NodeStarted);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_event_handlers_unsubscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.unsubscribe(handle);
        handlers.dispatch(Event::NodeStarted);

        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(handlers.handler_count(), 0);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _handle = handlers.subscribe(move |event| {
            if let Event::NodeLeft { .. } = event {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let router_side = handlers.clone();
        router_side.dispatch(Event::NodeLeft {
            node_id: NodeId::new("X"),
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_handlers_panic_isolation() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _handle1 = handlers.subscribe(|_event| {
            panic!("Handler panic");
        });

        let count_clone = Arc::clone(&count);
        let _handle2 = handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.dispatch(Event::NodeStarted);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let handlers = EventHandlers::new();
        let inner = handlers.clone();
        let slot = Arc::new(parking_lot::Mutex::new(None));
        let slot_clone = Arc::clone(&slot);

        let handle = handlers.subscribe(move |_event| {
            if let Some(handle) = slot_clone.lock().take() {
                inner.unsubscribe(handle);
            }
        });
        *slot.lock() = Some(handle);

        handlers.dispatch(Event::NodeStarted);
        assert_eq!(handlers.handler_count(), 0);
    }
}
