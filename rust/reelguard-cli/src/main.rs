mod display;
mod replay;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reelguard_core::{
    validate_identifiers, Clock, Engine, KeyValueStore, MemoryStore, MonitoredTarget,
    ReelguardConfig, SnapshotProvider, SystemClock,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::replay::LoggingNavigation;

#[derive(Parser)]
#[command(author, version, about = "Short-form video guard CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show guard state for every monitored app
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn the guard on for an app
    Enable { target: TargetArg },
    /// Turn the guard off for an app
    Disable { target: TargetArg },
    /// Lift an active block early
    ClearBlock {
        target: TargetArg,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show or change the view identifiers used for detection
    Ids {
        target: TargetArg,
        /// Replace the identifier list
        #[arg(long, num_args = 1.., conflicts_with = "reset")]
        set: Option<Vec<String>>,
        /// Restore the bundled identifiers for every app
        #[arg(long)]
        reset: bool,
    },
    /// Check an identifier list without storing it
    ValidateIds {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Drive the engine from a JSON-lines recording
    Replay {
        /// Recording file
        file: PathBuf,
        /// Use the configured store instead of a throwaway one
        #[arg(long)]
        persist: bool,
        /// Override the grace period
        #[arg(long)]
        grace_ms: Option<u64>,
        /// How long to keep running after the last step (default: grace + 5s)
        #[arg(long)]
        tail_ms: Option<u64>,
        /// Print the whole report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Youtube,
    Instagram,
}

impl From<TargetArg> for MonitoredTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Youtube => MonitoredTarget::YouTube,
            TargetArg::Instagram => MonitoredTarget::Instagram,
        }
    }
}

/// Get the reelguard data directory
fn reelguard_dir() -> PathBuf {
    std::env::var_os("REELGUARD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(ReelguardConfig::default_data_dir)
}

fn load_config() -> Result<ReelguardConfig> {
    let dir = reelguard_dir();
    ReelguardConfig::load_or_default(&dir)
        .with_context(|| format!("loading configuration from {}", dir.display()))
}

/// Engine over the configured store, with no window and logged navigation.
fn open_engine(config: &ReelguardConfig) -> Result<Engine> {
    Ok(Engine::from_config(
        config,
        Arc::new(SnapshotProvider::new(None)),
        Arc::new(LoggingNavigation::default()),
    )?)
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env("REELGUARD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_status(json: bool) -> Result<()> {
    let config = load_config()?;
    let engine = open_engine(&config)?;
    let status = engine.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        display::show_status(&status, SystemClock.now_ms());
        println!();
        println!("Data directory: {}", config.data_dir.display());
    }
    Ok(())
}

fn cmd_set_enabled(target: MonitoredTarget, enabled: bool) -> Result<()> {
    let engine = open_engine(&load_config()?)?;
    engine.set_enabled(target, enabled)?;
    println!(
        "{target} guard {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn cmd_clear_block(target: MonitoredTarget, yes: bool) -> Result<()> {
    let engine = open_engine(&load_config()?)?;
    let now = SystemClock.now_ms();
    let until = engine.blocked_until(target)?;
    if until <= now {
        println!("{target} is not blocked.");
        return Ok(());
    }

    println!("{target} is {}.", display::format_block(until, now));
    if !yes && !display::ask_confirmation("Lift the block now?", false)? {
        println!("Block kept.");
        return Ok(());
    }
    engine.clear_block(target)?;
    println!("{target} block cleared.");
    Ok(())
}

fn cmd_ids(target: MonitoredTarget, set: Option<Vec<String>>, reset: bool) -> Result<()> {
    let engine = open_engine(&load_config()?)?;
    if reset {
        engine.reset_identifiers()?;
        println!("Identifiers reset to bundled defaults.");
    } else if let Some(ids) = set {
        engine.update_identifiers(target, ids)?;
        println!("{target} identifiers updated.");
    }

    println!("{target} identifiers:");
    for id in engine.identifiers(target) {
        println!("  {id}");
    }
    Ok(())
}

fn cmd_validate_ids(ids: &[String]) -> Result<()> {
    validate_identifiers(ids)?;
    println!("OK: {} identifier(s) valid", ids.len());
    Ok(())
}

fn cmd_replay(
    file: &PathBuf,
    persist: bool,
    grace_ms: Option<u64>,
    tail_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let steps = replay::parse_script(&raw)?;
    if steps.is_empty() {
        bail!("{} contains no replay steps", file.display());
    }

    let config = load_config()?;
    let mut guard = config.guard.clone();
    if let Some(grace) = grace_ms {
        guard.grace_period_ms = grace;
    }
    let tail = Duration::from_millis(
        tail_ms.unwrap_or_else(|| replay::default_tail_ms(guard.grace_period_ms)),
    );
    let store: Arc<dyn KeyValueStore> = if persist {
        config.open_store()?
    } else {
        Arc::new(MemoryStore::new())
    };

    // Virtual time: sleeps complete as soon as every task is idle.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()?;
    let report = runtime.block_on(replay::run_replay(steps, store, guard, tail))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for event in &report.events {
        println!("{}", serde_json::to_string(event)?);
    }
    for action in &report.navigation {
        println!("navigation: {action}");
    }
    println!();
    display::show_status(&report.status, SystemClock.now_ms());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status { json } => {
            cmd_status(json)?;
        }
        Commands::Enable { target } => {
            cmd_set_enabled(target.into(), true)?;
        }
        Commands::Disable { target } => {
            cmd_set_enabled(target.into(), false)?;
        }
        Commands::ClearBlock { target, yes } => {
            cmd_clear_block(target.into(), yes)?;
        }
        Commands::Ids { target, set, reset } => {
            cmd_ids(target.into(), set, reset)?;
        }
        Commands::ValidateIds { ids } => {
            cmd_validate_ids(&ids)?;
        }
        Commands::Replay {
            file,
            persist,
            grace_ms,
            tail_ms,
            json,
        } => {
            cmd_replay(&file, persist, grace_ms, tail_ms, json)?;
        }
    }

    Ok(())
}
