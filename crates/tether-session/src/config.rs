//! Lifecycle and reporter configuration.
//!
//! The defaults mirror the values the engine integration shipped with;
//! every one of them can be overridden.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// LifecycleConfig
// ---------------------------------------------------------------------------

/// Timing and retry settings for [`ConnectionLifecycle`](crate::ConnectionLifecycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How often the timeout watch checks whether the link is up.
    pub poll_interval: Duration,

    /// How long a start may take before it is declared failed.
    pub connect_timeout: Duration,

    /// Reconnects allowed before the lifecycle settles at `Failed`.
    pub max_reconnect_attempts: u32,

    /// Pause before each reconnect attempt.
    pub reconnect_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(180),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl LifecycleConfig {
    /// Fixes values that would stall the timeout watch.
    ///
    /// - A zero `poll_interval` becomes 100 ms.
    /// - `connect_timeout` is raised to at least one `poll_interval`.
    pub fn validated(mut self) -> Self {
        if self.poll_interval.is_zero() {
            warn!("lifecycle poll_interval is zero, using 100ms");
            self.poll_interval = Duration::from_millis(100);
        }
        if self.connect_timeout < self.poll_interval {
            warn!(
                connect_timeout = ?self.connect_timeout,
                poll_interval = ?self.poll_interval,
                "connect_timeout shorter than poll_interval, raising it"
            );
            self.connect_timeout = self.poll_interval;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// ReporterConfig
// ---------------------------------------------------------------------------

/// Settings for [`ErrorReporter`](crate::ErrorReporter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Maximum records kept; the oldest is evicted first.
    pub history_capacity: usize,

    /// Whether connection errors request a reconnect at all.
    pub auto_reconnect: bool,

    /// Reconnect requests issued before recovery is declared exhausted.
    pub max_reconnect_attempts: u32,

    /// Delay between a connection error and its reconnect request.
    pub reconnect_delay: Duration,

    /// Whether timeout errors are retried like connection errors.
    pub reconnect_on_timeout: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(3),
            reconnect_on_timeout: false,
        }
    }
}

impl ReporterConfig {
    /// A zero `history_capacity` becomes 1 so the latest error is always
    /// queryable.
    pub fn validated(mut self) -> Self {
        if self.history_capacity == 0 {
            warn!("error history_capacity is zero, keeping one record");
            self.history_capacity = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_config_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(180));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_lifecycle_config_validated_fixes_zero_poll() {
        let config = LifecycleConfig {
            poll_interval: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            ..Default::default()
        }
        .validated();

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_reporter_config_defaults() {
        let config = ReporterConfig::default();
        assert_eq!(config.history_capacity, 100);
        assert!(config.auto_reconnect);
        assert!(!config.reconnect_on_timeout);
    }

    #[test]
    fn test_reporter_config_validated_keeps_one_record() {
        let config = ReporterConfig {
            history_capacity: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.history_capacity, 1);
    }
}
