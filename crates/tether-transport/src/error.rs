use crate::ConnectionId;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint is already hosting or connected.
    #[error("transport is already active")]
    AlreadyActive,

    /// Nothing is listening at the requested address.
    #[error("no host listening at {0}")]
    Unreachable(String),

    /// Another endpoint already listens at the requested address.
    #[error("address {0} already in use")]
    AddressInUse(String),

    /// The endpoint has no live link.
    #[error("transport is not connected")]
    NotConnected,

    /// The target connection is not known to this endpoint.
    #[error("unknown peer {0}")]
    UnknownPeer(ConnectionId),

    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}
