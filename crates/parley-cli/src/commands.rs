//! CLI command implementations

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parley::{ConnectionState, SessionConnectionManager, SocketIoFactory};
use parleyconf::{ConfigSources, ParleyConfig};
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Join `room`, print every room event as one JSON line, and leave on
/// Ctrl-C. A link that fails for good ends the command with an error.
pub async fn join(config: &ParleyConfig, room: &str) -> Result<()> {
    let manager = SessionConnectionManager::from_config(Arc::new(SocketIoFactory::new()), config);

    let connection = manager
        .connect(room)
        .await
        .with_context(|| format!("Failed to join room {} at {}", room, manager.endpoint()))?;
    info!("joined room {} ({:?})", room, connection);

    let mut events = Box::pin(connection.events());
    let mut states = manager.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving room {}", room);
                break;
            }
            event = events.next() => match event {
                Some(event) => println!("{}", event.to_json()),
                None => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match state {
                    ConnectionState::Reconnecting => warn!("connection lost, resuming"),
                    ConnectionState::Connected => info!("connected"),
                    ConnectionState::Failed => {
                        manager.disconnect();
                        match manager.last_error() {
                            Some(err) => bail!("Connection to room {} failed: {}", room, err),
                            None => bail!("Connection to room {} failed", room),
                        }
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
            }
        }
    }

    manager.disconnect();
    Ok(())
}

/// Print the effective configuration as TOML, sources as comments.
pub fn show_config(config: &ParleyConfig, sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {}", var);
    }
    println!();
    print!("{}", config.to_toml());
}
