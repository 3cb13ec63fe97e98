//! Connection lifecycle and error reporting for Tether.
//!
//! This crate answers two questions for the layers above it:
//!
//! 1. **Is the link up?** [`ConnectionLifecycle`] owns the
//!    [`ConnectionStatus`], starts the transport as host or client, detects
//!    connect timeouts and runs bounded reconnects.
//! 2. **What went wrong?** [`ErrorReporter`] keeps a bounded history of
//!    [`ErrorRecord`]s and turns recoverable ones into reconnect requests.
//!
//! # How it fits in the stack
//!
//! ```text
//! RPC / Stats (above)   ← observe LifecycleEvents, report errors
//!     ↕
//! Session (this crate)  ← owns connection status and error history
//!     ↕
//! Transport (below)     ← started, polled and stopped by the lifecycle
//! ```
//!
//! The lifecycle reports its own failures to the reporter. The reporter
//! never calls back into the lifecycle; whoever wires the two together
//! forwards [`ErrorEvent::ReconnectRequested`] to
//! [`ConnectionLifecycle::reconnect_after`].

mod config;
mod error;
mod lifecycle;
mod reporter;

pub use config::{LifecycleConfig, ReporterConfig};
pub use error::SessionError;
pub use lifecycle::{ConnectionLifecycle, ConnectionStatus, LifecycleEvent, LinkTarget, Mode};
pub use reporter::{ErrorEvent, ErrorKind, ErrorRecord, ErrorReporter};
