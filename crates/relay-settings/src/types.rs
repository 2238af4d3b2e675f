//! Settings structures.
//!
//! Every struct is `#[serde(default)]`, so a settings file only needs the
//! keys it overrides. Keys are camelCase on disk.

use relay_core::constants::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_REAPER_INTERVAL_SECS,
    DEFAULT_SEND_TIMEOUT_MS, DEFAULT_TOPIC_GRACE_SECS,
};
use relay_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Topic registry and background task tuning.
    pub realtime: RealtimeSettings,
    /// Credential validation.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rt = &self.realtime;
        if rt.history_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.historyCapacity must be at least 1".into(),
            ));
        }
        if rt.send_queue_capacity <= rt.history_capacity {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.sendQueueCapacity ({}) must exceed realtime.historyCapacity ({})",
                rt.send_queue_capacity, rt.history_capacity
            )));
        }
        if rt.liveness_interval_secs == 0 || rt.reaper_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "background task intervals must be non-zero".into(),
            ));
        }
        if rt.liveness_timeout_secs < rt.liveness_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.livenessTimeoutSecs ({}) must be >= livenessIntervalSecs ({})",
                rt.liveness_timeout_secs, rt.liveness_interval_secs
            )));
        }
        if rt.send_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.sendTimeoutMs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Largest accepted inbound WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_message_size: 64 * 1024,
        }
    }
}

/// Topic registry and background task tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Events retained per topic for replay.
    pub history_capacity: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Bound on a single send before the connection is evicted.
    pub send_timeout_ms: u64,
    /// Interval between liveness probes.
    pub liveness_interval_secs: u64,
    /// Silence after which a connection is force-disconnected.
    pub liveness_timeout_secs: u64,
    /// Interval between idle-topic sweeps.
    pub reaper_interval_secs: u64,
    /// How long an idle topic survives.
    pub topic_grace_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            send_queue_capacity: 256,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            liveness_interval_secs: DEFAULT_LIVENESS_INTERVAL_SECS,
            liveness_timeout_secs: DEFAULT_LIVENESS_INTERVAL_SECS * 2,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            topic_grace_secs: DEFAULT_TOPIC_GRACE_SECS,
        }
    }
}

/// Credential validation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret for bearer tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Clock skew tolerated on `exp`.
    pub jwt_leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_leeway_secs: 30,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 8765);
        assert_eq!(s.realtime.history_capacity, 100);
        assert_eq!(s.realtime.liveness_interval_secs, 30);
        assert_eq!(s.realtime.liveness_timeout_secs, 60);
        assert_eq!(s.realtime.reaper_interval_secs, 300);
        assert_eq!(s.realtime.topic_grace_secs, 300);
        assert!(s.auth.jwt_secret.is_none());
        assert_eq!(s.logging.level, "info");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_on_disk() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["realtime"]["historyCapacity"].is_number());
        assert!(json["server"]["maxMessageSize"].is_number());
        assert!(json["auth"].get("jwtSecret").is_none());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"realtime":{"historyCapacity":5}}"#).unwrap();
        assert_eq!(s.realtime.history_capacity, 5);
        assert_eq!(s.realtime.send_queue_capacity, 256);
        assert_eq!(s.server.port, 8765);
    }

    #[test]
    fn validate_rejects_zero_history() {
        let mut s = RelaySettings::default();
        s.realtime.history_capacity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_queue_smaller_than_history() {
        let mut s = RelaySettings::default();
        s.realtime.send_queue_capacity = 50;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("sendQueueCapacity"));
    }

    #[test]
    fn validate_rejects_timeout_below_interval() {
        let mut s = RelaySettings::default();
        s.realtime.liveness_timeout_secs = 10;
        assert!(s.validate().is_err());
    }
}
