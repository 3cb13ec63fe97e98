//! Transport boundary for Tether.
//!
//! Tether never opens sockets. Whatever owns the real connection (a game
//! engine's netcode layer, a WebSocket pump, an in-process test hub)
//! implements the [`Transport`] trait and pushes [`TransportEvent`]s into
//! the channel the core listens on.
//!
//! ```text
//! Transport (bytes, connect/disconnect) → Protocol (frames) → Session / RPC
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default): in-process [`MemoryHub`] transport, used by the
//!   demos and by the test suites of the upper layers.

mod error;
#[cfg(feature = "memory")]
mod memory;

pub use error::TransportError;
#[cfg(feature = "memory")]
pub use memory::{MemoryHub, MemoryTransport};

use std::fmt;

use tokio::sync::mpsc;

/// Opaque identifier for a connection. Ordered by the raw id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// The server side of a link. A host's own client link also uses it.
    pub const SERVER: ConnectionId = ConnectionId(0);

    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Whether this id addresses the server.
    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Notifications a transport delivers to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote endpoint connected (or, on a client, the server accepted us).
    Connected(ConnectionId),
    /// A remote endpoint went away.
    Disconnected(ConnectionId),
    /// A complete message arrived from `from`.
    Received { from: ConnectionId, data: Vec<u8> },
}

/// Sending half of a transport event channel.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// An already-framed, reliable, ordered bidirectional transport.
///
/// All methods are synchronous: `connect_as_*` only *begins* connecting.
/// Progress is observed through [`is_server_active`](Self::is_server_active),
/// [`is_client_connected`](Self::is_client_connected),
/// [`local_client_id`](Self::local_client_id) and the event channel.
///
/// The trait is object safe so the core can hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + 'static {
    /// Starts listening as a host (server plus local client).
    fn connect_as_host(&self, address: &str, port: u16) -> Result<(), TransportError>;

    /// Starts connecting to a remote host.
    fn connect_as_client(&self, address: &str, port: u16) -> Result<(), TransportError>;

    /// Tears down whatever this endpoint is doing. Idempotent.
    fn disconnect(&self);

    /// Whether the local server is accepting connections.
    fn is_server_active(&self) -> bool;

    /// Whether the local client link is connected.
    fn is_client_connected(&self) -> bool;

    /// The identity assigned to the local client link, once it has one.
    fn local_client_id(&self) -> Option<ConnectionId>;

    /// Sends one message to `to`.
    fn send_bytes(&self, to: ConnectionId, data: &[u8]) -> Result<(), TransportError>;

    /// Number of live remote links. Defaults to 0 for transports that
    /// don't track it.
    fn peer_count(&self) -> usize {
        0
    }
}
