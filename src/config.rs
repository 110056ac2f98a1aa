use serde::{Deserialize, Serialize};

/// Tuning for a single [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Frames queued for the writer task before `send` waits.
    pub outbound_queue: usize,
    /// Frames read off the wire before the reader task waits for `receive`.
    pub inbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            inbound_queue: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests dispatched concurrently per connection. Further requests wait
    /// to be read until a dispatch finishes.
    pub max_in_flight: usize,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            connection: ConnectionConfig::default(),
        }
    }
}
