//! RPC configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::RequestKind;
use tracing::warn;

/// Settings for the [`Correlator`](crate::Correlator) and
/// [`RequestRouter`](crate::RequestRouter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout for requests sent without an explicit one.
    pub default_timeout: Duration,

    /// The one request kind whose handlers may answer with no response
    /// (fire-and-forget broadcasts such as chat).
    pub broadcast_kind: Option<RequestKind>,

    /// How many timed-out request ids are remembered so their late
    /// responses can be told apart from broadcasts.
    pub expired_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(180),
            broadcast_kind: Some(RequestKind::Chat),
            expired_capacity: 256,
        }
    }
}

impl RpcConfig {
    /// - A zero `default_timeout` is replaced by the 180 s default.
    /// - A zero `expired_capacity` becomes 1.
    pub fn validated(mut self) -> Self {
        if self.default_timeout.is_zero() {
            warn!("rpc default_timeout is zero, using 180s");
            self.default_timeout = Duration::from_secs(180);
        }
        if self.expired_capacity == 0 {
            warn!("rpc expired_capacity is zero, remembering one id");
            self.expired_capacity = 1;
        }
        self
    }
}
