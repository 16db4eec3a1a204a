//! Server, manual-mode, storage, and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP / control-channel listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// Per-console outbound queue depth. A console whose queue is full is
    /// treated as dead.
    pub max_send_queue: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// A console that has not answered a ping for this long is dropped.
    pub client_timeout_ms: u64,
    /// How often the dead-console sweep runs, in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_send_queue: 256,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Manual-mode coordinator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManualSettings {
    /// How long a caller waits for an operator before receiving a 504.
    pub timeout_secs: u64,
    /// Interval at which a held request checks whether its caller is gone.
    pub disconnect_poll_ms: u64,
}

impl Default for ManualSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            disconnect_poll_ms: 1000,
        }
    }
}

impl ManualSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn disconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disconnect_poll_ms)
    }
}

/// On-disk state for preset queues and bypass configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub preset_queue_path: String,
    pub bypass_config_path: String,
    /// Attempts per snapshot before the write-behind worker gives up on it.
    pub persist_max_retries: u32,
    pub persist_retry_delay_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            preset_queue_path: "preset_queues.json".to_string(),
            bypass_config_path: "bypass_config.json".to_string(),
            persist_max_retries: 3,
            persist_retry_delay_ms: 200,
        }
    }
}

/// Log level for the stdout subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_defaults_match_legacy_constants() {
        let m = ManualSettings::default();
        assert_eq!(m.timeout(), Duration::from_secs(300));
        assert_eq!(m.disconnect_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn server_durations() {
        let s = ServerSettings::default();
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(s.client_timeout(), Duration::from_secs(90));
        assert_eq!(s.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn storage_camel_case_keys() {
        let json = serde_json::to_value(StorageSettings::default()).unwrap();
        assert_eq!(json["presetQueuePath"], "preset_queues.json");
        assert_eq!(json["bypassConfigPath"], "bypass_config.json");
        assert_eq!(json["persistMaxRetries"], 3);
    }

    #[test]
    fn log_level_filter_strings() {
        assert_eq!(LogLevel::Warn.as_filter_str(), "warn");
        let parsed: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(parsed, LogLevel::Debug);
    }
}
