//! Unified error type for the Tether facade.

use tether_protocol::ProtocolError;
use tether_rpc::RpcError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// Users of the `tether` crate deal with this one type; `?` converts the
/// layer errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Connecting, sending or stopping at the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding or decoding a frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Starting, reconnecting or failing the connection.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Sending a request or handling an inbound one.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Parsing a JSON configuration document.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
