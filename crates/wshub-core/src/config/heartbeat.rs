//! Heartbeat (ping/pong liveness) configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heartbeat settings for the WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether idle connections are pinged and unresponsive ones evicted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between heartbeat sweeps in milliseconds.
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
}

impl HeartbeatConfig {
    /// Returns the sweep interval, or `None` when the heartbeat is off.
    ///
    /// A zero interval is treated as disabled.
    pub fn interval(&self) -> Option<Duration> {
        if self.enabled && self.interval_ms > 0 {
            Some(Duration::from_millis(self.interval_ms))
        } else {
            None
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    30_000
}
