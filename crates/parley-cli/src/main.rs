//! parley - interview room connection CLI
//!
//! Subcommands:
//! - `parley join <room>` - Join a room and print its events as JSON lines
//! - `parley config` - Show the effective configuration and where it came from

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parleyconf::ParleyConfig;

mod commands;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Realtime interview room client")]
#[command(version)]
struct Cli {
    /// Config file (overrides the local parley.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and stream its events until Ctrl-C
    Join {
        /// Room (interview session) id
        room: String,

        /// Backend base URL (e.g., http://localhost:5000)
        #[arg(long)]
        url: Option<String>,

        /// Socket.IO path on the backend
        #[arg(long)]
        path: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = ParleyConfig::load_with_sources_from(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Join { room, url, path } => {
            if let Some(url) = url {
                config.realtime.base_url = url;
            }
            if let Some(path) = path {
                config.realtime.path = path;
            }
            config.validate()?;
            commands::join(&config, &room).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &sources);
        }
    }

    Ok(())
}

/// RUST_LOG wins over the configured level.
fn init_tracing(config: &ParleyConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.telemetry.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
