//! Error types for the RPC layer.

use tether_protocol::ProtocolError;
use tether_transport::TransportError;

/// Errors returned by [`Correlator`](crate::Correlator) and
/// [`Dispatcher`](crate::Dispatcher) calls.
///
/// A request's callback is resolved even when one of these is returned;
/// the error is for callers that sent without one.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The lifecycle is not `Connected`.
    #[error("not connected")]
    NotConnected,

    /// An inbound frame could not be decoded.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport refused to send.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The request was dropped before it was resolved.
    #[error("request canceled")]
    Canceled,
}
