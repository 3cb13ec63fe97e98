//! Request routing and correlation for Tether.
//!
//! - **Router** ([`RequestRouter`]) maps request kinds to handlers on the
//!   receiving side and always produces a well-formed answer.
//! - **Correlator** ([`Correlator`]) assigns ids on the sending side,
//!   tracks pending callbacks and enforces per-request timeouts.
//! - **Dispatcher** ([`Dispatcher`]) feeds inbound transport bytes to one
//!   or the other.
//!
//! ```text
//!  caller ── send ──→ Correlator ── bytes ──→ transport ──→ Dispatcher ──→ RequestRouter
//!    ↑                    ↑                                      │              │
//!    └──── callback ──────┴──────── Dispatcher ←── transport ←───┴── response ──┘
//! ```

mod config;
mod correlator;
mod dispatcher;
mod error;
mod router;

pub use config::RpcConfig;
pub use correlator::{Correlator, CorrelatorParts, ResponseCallback};
pub use dispatcher::{Dispatcher, Inbound};
pub use error::RpcError;
pub use router::{HandlerError, HandlerResult, RequestRouter};
