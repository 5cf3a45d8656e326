//! Configuration loading for Parley.
//!
//! Parley keeps its configuration small: where the realtime endpoint lives,
//! how the transport reconnects, how the room session keeps itself alive,
//! and how loud the logs are.
//!
//! # Usage
//!
//! ```rust,no_run
//! use parleyconf::ParleyConfig;
//!
//! let config = ParleyConfig::load().expect("Failed to load config");
//! println!("endpoint: {}{}", config.realtime.base_url, config.realtime.path);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/parley/config.toml` (system)
//! 2. `~/.config/parley/config.toml` (user)
//! 3. `./parley.toml` (local override, replaced by an explicit path)
//! 4. Environment variables (`PARLEY_*`, `RUST_LOG`)
//!
//! Files are merged table by table, so a file only overrides the keys it
//! actually names.
//!
//! # Example Config
//!
//! ```toml
//! [realtime]
//! base_url = "https://interviews.example.com"
//! path = "/socket.io"
//!
//! [reconnect]
//! attempts = 10
//! delay_ms = 1000
//! delay_max_ms = 5000
//! timeout_ms = 20000
//!
//! [session]
//! heartbeat_interval_ms = 15000
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{ReconnectConfig, RealtimeConfig, SessionConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete Parley configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParleyConfig {
    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ParleyConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with `config_path` replacing `./parley.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject settings the session layer cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.realtime.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("realtime.base_url is empty".into()));
        }
        if self.session.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.reconnect.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.timeout_ms must be positive".into(),
            ));
        }
        if self.reconnect.delay_max_ms < self.reconnect.delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.delay_max_ms ({}) is below reconnect.delay_ms ({})",
                self.reconnect.delay_max_ms, self.reconnect.delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.randomization) {
            return Err(ConfigError::Invalid(
                "reconnect.randomization must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# Parley Configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render: {}\n", e)),
        }
        output
    }
}
