//! CLI command definitions and handlers

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use epc_station::{
    EpcCode, Station, StationConfig, StationError, SubmitOutcome, SyncEvent, SyncSummary,
};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

static CHECK: Emoji = Emoji("✓ ", "* ");
static CROSS: Emoji = Emoji("✗ ", "x ");
static ARROW: Emoji = Emoji("→ ", "-> ");
static INFO: Emoji = Emoji("ℹ ", "i ");
static DISK: Emoji = Emoji("💾 ", "~ ");

#[derive(Parser)]
#[command(name = "epc-station")]
#[command(author, version, about = "Offline-first EPC scan recorder")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: <config dir>/epc-station/station.toml)
    #[arg(short, long, global = true, env = "EPC_STATION_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read scans from stdin until EOF or Ctrl-C, syncing in the background
    Run,

    /// Record a single scan
    Submit {
        /// EPC code (24 characters, starting with E)
        epc: String,
    },

    /// Push buffered scans to the record store
    Sync {
        /// Skip the connectivity probe
        #[arg(long)]
        assume_online: bool,
    },

    /// Show pending scans and station identity
    Status,

    /// Print the effective configuration
    Config {
        /// Write it back to the configuration file
        #[arg(long)]
        save: bool,
    },
}

pub async fn run(config: StationConfig) -> Result<()> {
    let mut station = Station::connect(config).context("failed to open station")?;
    station.on_sync_event(|event| match event {
        SyncEvent::PassCompleted(summary) => print_summary(&summary),
        SyncEvent::RecordRejected { tag, captured_at } => print_rejected(&tag, captured_at),
        _ => {}
    });

    let tasks = station
        .spawn_background()
        .context("failed to start background tasks")?;

    println!(
        "{} Station {} ready, {} scan(s) waiting for sync",
        INFO,
        style(&station.identity().station_no).cyan(),
        station.pending_count()?
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read scanner input")? else {
                    break;
                };
                let tag = line.trim();
                if tag.is_empty() {
                    continue;
                }
                let result = station.submit(tag).await;
                print_outcome(tag, &result);
            }
            _ = &mut ctrl_c => break,
        }
    }

    tasks.shutdown().await;
    println!(
        "{} Stopped, {} scan(s) waiting for sync",
        INFO,
        station.pending_count()?
    );
    Ok(())
}

pub async fn submit(config: StationConfig, epc: &str) -> Result<()> {
    let station = Station::connect(config).context("failed to open station")?;
    station.probe_once().await?;

    let result = station.submit(epc).await;
    print_outcome(epc, &result);
    result.context("scan was not recorded")?;
    Ok(())
}

pub async fn sync(config: StationConfig, assume_online: bool) -> Result<()> {
    let mut station = Station::connect(config).context("failed to open station")?;
    station.on_sync_event(|event| {
        if let SyncEvent::RecordRejected { tag, captured_at } = event {
            print_rejected(&tag, captured_at);
        }
    });

    if assume_online {
        station.set_online(true);
    } else {
        station.probe_once().await?;
    }

    if !station.is_online() {
        println!(
            "{} Network offline, {} scan(s) kept locally",
            CROSS,
            station.pending_count()?
        );
        return Ok(());
    }

    println!("{} Syncing buffered scans...", ARROW);
    let summary = station.trigger_sync().await.context("sync failed")?;
    print_summary(&summary);
    Ok(())
}

pub fn status(config: StationConfig) -> Result<()> {
    let station = Station::connect(config).context("failed to open station")?;
    let identity = station.identity();

    println!("{}", style("Station:").bold());
    println!("  Number:   {}", style(&identity.station_no).cyan());
    println!("  Factory:  {}", identity.factory_code);
    println!("  Address:  {}", identity.address);
    println!("{}", style("Offline queue:").bold());
    if let Some(path) = station.queue_path() {
        println!("  Path:     {}", style(path.display()).dim());
    }
    println!("  Pending:  {}", style(station.pending_count()?).yellow());
    Ok(())
}

pub fn show_config(config: &StationConfig, save_to: Option<Option<&Path>>) -> Result<()> {
    print!("{}", config.to_toml()?);

    if let Some(path) = save_to {
        config.save(path).context("failed to save configuration")?;
        let shown = path
            .map(Path::to_path_buf)
            .unwrap_or_else(StationConfig::default_path);
        println!("{} Saved to {}", CHECK, style(shown.display()).green());
    }
    Ok(())
}

fn print_outcome(tag: &str, result: &Result<SubmitOutcome, StationError>) {
    match result {
        Ok(outcome @ SubmitOutcome::Applied) => {
            println!("{} {} {}", CHECK, style(tag).cyan(), style(outcome).green());
        }
        Ok(outcome @ SubmitOutcome::Buffered) => {
            println!("{} {} {}", DISK, style(tag).cyan(), style(outcome).yellow());
        }
        Ok(outcome @ SubmitOutcome::ValidationFailed) => {
            println!("{} {} {}", CROSS, style(tag).cyan(), style(outcome).red());
        }
        Ok(outcome) => {
            println!("{} {} {}", INFO, style(tag).cyan(), outcome);
        }
        Err(e) => {
            println!("{} {} {}", CROSS, style(tag).cyan(), style(e).red().bold());
        }
    }
}

fn print_rejected(tag: &EpcCode, captured_at: DateTime<Utc>) {
    println!(
        "{} {} scanned {} was refused by the record store and dropped",
        CROSS,
        style(tag).cyan(),
        captured_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_summary(summary: &SyncSummary) {
    if summary.attempted == 0 && summary.still_pending == 0 {
        println!("{} Nothing to sync", CHECK);
        return;
    }
    let marker = if summary.aborted || summary.failed > 0 {
        CROSS
    } else {
        CHECK
    };
    println!("{} {}", marker, summary);
}
