//! Configuration sections. Each maps to one TOML table.

use serde::{Deserialize, Serialize};

/// Where the realtime transport lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Backend base URL. `http`/`https` are rewritten to `ws`/`wss`.
    /// Default: http://localhost:5000
    #[serde(default = "RealtimeConfig::default_base_url")]
    pub base_url: String,

    /// Path prefix of the realtime endpoint.
    /// Default: /socket.io
    #[serde(default = "RealtimeConfig::default_path")]
    pub path: String,
}

impl RealtimeConfig {
    fn default_base_url() -> String {
        "http://localhost:5000".to_string()
    }

    fn default_path() -> String {
        "/socket.io".to_string()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            path: Self::default_path(),
        }
    }
}

/// Automatic reconnection and handshake deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether the transport resumes on its own after an unexpected drop.
    #[serde(default = "ReconnectConfig::default_enabled")]
    pub enabled: bool,

    /// Reconnection budget.
    /// Default: 10
    #[serde(default = "ReconnectConfig::default_attempts")]
    pub attempts: u32,

    /// Initial reconnection delay in milliseconds.
    /// Default: 1000
    #[serde(default = "ReconnectConfig::default_delay_ms")]
    pub delay_ms: u64,

    /// Ceiling for the reconnection delay in milliseconds.
    /// Default: 5000
    #[serde(default = "ReconnectConfig::default_delay_max_ms")]
    pub delay_max_ms: u64,

    /// Jitter factor in [0, 1].
    /// Default: 0.5
    #[serde(default = "ReconnectConfig::default_randomization")]
    pub randomization: f64,

    /// Connect attempt timeout in milliseconds.
    /// Default: 20000
    #[serde(default = "ReconnectConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ReconnectConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_attempts() -> u32 {
        10
    }

    fn default_delay_ms() -> u64 {
        1_000
    }

    fn default_delay_max_ms() -> u64 {
        5_000
    }

    fn default_randomization() -> f64 {
        0.5
    }

    fn default_timeout_ms() -> u64 {
        20_000
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            attempts: Self::default_attempts(),
            delay_ms: Self::default_delay_ms(),
            delay_max_ms: Self::default_delay_max_ms(),
            randomization: Self::default_randomization(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// Interview-room session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keep-alive period while connected, in milliseconds.
    /// Default: 15000 (below half the server's ping timeout)
    #[serde(default = "SessionConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl SessionConfig {
    fn default_heartbeat_interval_ms() -> u64 {
        15_000
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
        }
    }
}

/// Logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or `EnvFilter` directive string.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
