//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, ParleyConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns existing paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/parley/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("parley/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("parley.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deserialize a (possibly partial) table; missing keys take defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<ParleyConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key, anything
/// else in `overlay` replaces the value in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ParleyConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("PARLEY_BACKEND_URL") {
        config.realtime.base_url = v;
        sources.env_overrides.push("PARLEY_BACKEND_URL".to_string());
    }
    if let Ok(v) = env::var("PARLEY_SOCKET_PATH") {
        config.realtime.path = v;
        sources.env_overrides.push("PARLEY_SOCKET_PATH".to_string());
    }

    if let Ok(v) = env::var("PARLEY_RECONNECT_ATTEMPTS") {
        if let Ok(attempts) = v.parse() {
            config.reconnect.attempts = attempts;
            sources.env_overrides.push("PARLEY_RECONNECT_ATTEMPTS".to_string());
        }
    }
    if let Ok(v) = env::var("PARLEY_CONNECT_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.reconnect.timeout_ms = ms;
            sources.env_overrides.push("PARLEY_CONNECT_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("PARLEY_HEARTBEAT_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.session.heartbeat_interval_ms = ms;
            sources.env_overrides.push("PARLEY_HEARTBEAT_INTERVAL_MS".to_string());
        }
    }

    if let Ok(v) = env::var("PARLEY_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("PARLEY_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
