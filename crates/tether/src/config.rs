//! Node configuration.

use serde::{Deserialize, Serialize};
use tether_rpc::RpcConfig;
use tether_session::{LifecycleConfig, ReporterConfig};
use tether_stats::StatsConfig;

use crate::TetherError;

/// Everything a [`Node`](crate::Node) needs to know up front.
///
/// Missing sections and fields take their defaults, so `{}` is a valid
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Stamped into every outgoing request as its sender.
    pub local_name: String,
    pub lifecycle: LifecycleConfig,
    pub errors: ReporterConfig,
    pub rpc: RpcConfig,
    pub stats: StatsConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            local_name: "tether".to_string(),
            lifecycle: LifecycleConfig::default(),
            errors: ReporterConfig::default(),
            rpc: RpcConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Parses a JSON document the host application loaded itself.
    ///
    /// # Errors
    /// [`TetherError::Config`] when the document is not valid JSON or a
    /// field has the wrong shape.
    pub fn from_json(text: &str) -> Result<Self, TetherError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Names outgoing requests after `name`.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = name.into();
        self
    }
}
