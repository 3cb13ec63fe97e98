//! Error types for the session layer.

use tether_transport::TransportError;

use crate::ConnectionStatus;

/// Errors returned by [`ConnectionLifecycle`](crate::ConnectionLifecycle)
/// operations.
///
/// These describe why a call was refused. Runtime failures observed while
/// connecting are recorded by the [`ErrorReporter`](crate::ErrorReporter)
/// as well.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A start was requested while a connection is being made or is up.
    #[error("connection already active ({0})")]
    AlreadyActive(ConnectionStatus),

    /// Reconnect was requested but nothing was ever started.
    #[error("no host or client mode to reconnect")]
    NoStoredMode,

    /// The reconnect budget is spent; the lifecycle is now `Failed`.
    #[error("reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { attempts: u32 },

    /// The transport refused to start.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
