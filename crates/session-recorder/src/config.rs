use std::net::SocketAddr;
use std::time::Duration;

use network_tap::TapConfig;
use page_observers::ObserverConfig;
use serde::{Deserialize, Serialize};

/// Backend log hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub bind: SocketAddr,
    pub heartbeat_interval_ms: u64,
    pub websocket_path: String,
    pub health_path: String,
    /// Capacity of the log fan-out channel; slow sessions lose the oldest entries.
    pub fanout_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            heartbeat_interval_ms: 15_000,
            websocket_path: "/__bugtrail/backend".into(),
            health_path: "/__bugtrail/health".into(),
            fanout_capacity: 1024,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Per-session recording settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub observer: ObserverConfig,
    pub tap: TapConfig,
    /// Skip injecting the observer script; interactions and window errors are then not recorded.
    pub skip_observer_injection: bool,
}
