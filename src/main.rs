//! EPC Station - scanner front end
//!
//! Reads scans from stdin (one EPC per line, as sent by a keyboard-wedge
//! reader) and records them, buffering locally while offline.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use epc_station::StationConfig;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env next to the binary, same keys as the environment overrides
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = StationConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run => {
            cli::run(config).await?;
        }
        Commands::Submit { epc } => {
            cli::submit(config, &epc).await?;
        }
        Commands::Sync { assume_online } => {
            cli::sync(config, assume_online).await?;
        }
        Commands::Status => {
            cli::status(config)?;
        }
        Commands::Config { save } => {
            cli::show_config(&config, save.then_some(cli.config.as_deref()))?;
        }
    }

    Ok(())
}
