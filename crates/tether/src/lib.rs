//! # Tether
//!
//! Request/response messaging for networked game clients and hosts.
//!
//! Tether sits on top of a transport you supply (anything implementing
//! [`Transport`](tether_transport::Transport)) and gives the game a small
//! RPC surface: typed payloads, handlers per request kind, responses
//! matched to their requests with timeouts, a connection state machine
//! with bounded reconnects, an error history, and live network stats.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tether::prelude::*;
//!
//! # async fn demo() -> Result<(), TetherError> {
//! let hub = MemoryHub::new();
//! let (transport, events) = hub.endpoint();
//! let node = Node::new(TetherConfig::default(), Arc::new(transport), events);
//!
//! node.register_request_handler(RequestKind::Ping, |req| {
//!     Ok(Some(Response::reply(req, ResponseCode::Success, "pong")))
//! });
//! node.start_host("127.0.0.1", 7777)?;
//!
//! let response = node.request(Request::new(RequestKind::Ping), None).await;
//! assert_eq!(response.message, "pong");
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod node;
pub mod telemetry;

pub use config::TetherConfig;
pub use error::TetherError;
pub use node::{Node, Outlet};

pub use tether_protocol as protocol;
pub use tether_rpc as rpc;
pub use tether_session as session;
pub use tether_stats as stats;
pub use tether_transport as transport;

/// Convenience re-exports for common usage.
///
/// ```rust
/// use tether::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Node, Outlet, TetherConfig, TetherError};

    pub use tether_protocol::{
        Codec, Payload, Quaternion, Request, RequestId, RequestKind, Response, ResponseCode,
        Vector3,
    };
    pub use tether_rpc::{HandlerError, HandlerResult, ResponseCallback};
    pub use tether_session::{
        ConnectionStatus, ErrorEvent, ErrorKind, ErrorRecord, LifecycleEvent, Mode,
    };
    pub use tether_stats::NetworkStats;
    pub use tether_transport::{ConnectionId, Transport, TransportEvent};

    #[cfg(feature = "memory")]
    pub use tether_transport::{MemoryHub, MemoryTransport};
}
