use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the client embedded in an observed process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket endpoint of the backend log hub.
    pub hub_url: String,
    /// Port the observed process listens on; sent on registration.
    pub server_port: u16,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed reconnects before the client disables itself.
    pub max_attempts: u32,
    /// Records kept while the hub is unreachable; oldest dropped first.
    pub buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:7420/__bugtrail/backend".into(),
            server_port: 3000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: 10,
            buffer_capacity: 500,
        }
    }
}

impl ClientConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
