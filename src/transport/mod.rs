//! Link transport boundary
//!
//! The mesh engine never touches a radio. It hands encoded frames to a
//! [`Transport`] and receives link activity through a [`LinkSender`], which
//! only enqueues onto the router's command queue and never waits on routing.

pub mod memory;

use crate::error::{MeshError, Result, TransportError};
use crate::protocol::PeerHandle;
use crate::routing::Command;
use tokio::sync::mpsc;

/// Outbound side of a point-to-point link layer
///
/// Implementations must not block: the router calls these methods from its
/// event loop.
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to a connected peer
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the peer is gone or the write fails.
    fn send_frame(&self, peer: PeerHandle, frame: Vec<u8>) -> std::result::Result<(), TransportError>;

    /// Close a link, e.g. when the connection cap is reached
    fn close_link(&self, peer: PeerHandle) {
        let _ = peer;
    }
}

/// Link-level connection state of the local device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not participating in the mesh
    Idle,
    /// Running, no links yet
    Listening,
    /// At least one link is up
    Connected,
}

/// Link activity reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link to a new peer came up
    Connected(PeerHandle),
    /// A link went down
    Disconnected(PeerHandle),
    /// A frame arrived on a link
    Frame {
        /// Link the frame arrived on
        peer: PeerHandle,
        /// Raw frame bytes
        bytes: Vec<u8>,
    },
}

/// Cloneable handle the transport uses to report link activity
#[derive(Debug, Clone)]
pub struct LinkSender {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkSender {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Report a link event
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EngineStopped`] once the router has shut down.
    pub fn send(&self, event: LinkEvent) -> Result<()> {
        self.commands
            .send(Command::Link(event))
            .map_err(|_| MeshError::EngineStopped)
    }

    /// Report a new link
    pub fn connected(&self, peer: PeerHandle) -> Result<()> {
        self.send(LinkEvent::Connected(peer))
    }

    /// Report a closed link
    pub fn disconnected(&self, peer: PeerHandle) -> Result<()> {
        self.send(LinkEvent::Disconnected(peer))
    }

    /// Report a received frame
    pub fn frame_received(&self, peer: PeerHandle, bytes: Vec<u8>) -> Result<()> {
        self.send(LinkEvent::Frame { peer, bytes })
    }

    /// Whether the router is still accepting events
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}
