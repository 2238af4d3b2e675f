//! Server configuration.

use std::time::Duration;

use relay_core::constants::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_REAPER_INTERVAL_SECS,
    DEFAULT_SEND_TIMEOUT_MS, DEFAULT_TOPIC_GRACE_SECS,
};
use relay_settings::RelaySettings;

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Registry and background task tuning.
    pub realtime: RealtimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 64 * 1024,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            realtime: RealtimeConfig::from_settings(settings),
        }
    }
}

/// Timing and capacity knobs for the topic registry and its background tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Events retained per topic for replay.
    pub history_capacity: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Bound on one send to one connection.
    pub send_timeout: Duration,
    /// Interval between liveness probes.
    pub liveness_interval: Duration,
    /// Silence after which a connection is force-disconnected.
    pub liveness_timeout: Duration,
    /// Interval between idle-topic sweeps.
    pub reaper_interval: Duration,
    /// How long a topic with zero connections survives.
    pub topic_grace: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            send_queue_capacity: 256,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            liveness_timeout: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS * 2),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            topic_grace: Duration::from_secs(DEFAULT_TOPIC_GRACE_SECS),
        }
    }
}

impl RealtimeConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let rt = &settings.realtime;
        Self {
            history_capacity: rt.history_capacity,
            send_queue_capacity: rt.send_queue_capacity,
            send_timeout: Duration::from_millis(rt.send_timeout_ms),
            liveness_interval: Duration::from_secs(rt.liveness_interval_secs),
            liveness_timeout: Duration::from_secs(rt.liveness_timeout_secs),
            reaper_interval: Duration::from_secs(rt.reaper_interval_secs),
            topic_grace: Duration::from_secs(rt.topic_grace_secs),
        }
    }
}
