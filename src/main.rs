//! Realtime MEA CLI
//!
//! Incremental spike sorting of multi-electrode array recordings.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use realtime_mea::{
    layout::{COORDS_FILE, REFERENCE_FILE},
    pipeline::{reference_gate, Blocked, RunLedger, SegmentStatus, TreeSnapshot},
    Config, Driver, Workspace, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "realtime-mea")]
#[command(version = VERSION)]
#[command(about = "Incremental processing of multi-electrode array recordings", long_about = None)]
struct Cli {
    /// Workspace root
    #[arg(long, short, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a workspace with a default configuration
    Init {
        /// Overwrite an existing config.yaml
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline until interrupted
    Start,

    /// Run a single pipeline tick
    Tick,

    /// Show per-block progress and the run ledger
    Status,

    /// Show the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let workspace = Workspace::new(cli.workspace);

    match cli.command {
        Commands::Init { force } => cmd_init(&workspace, force),
        Commands::Start => cmd_start(workspace),
        Commands::Tick => cmd_tick(workspace),
        Commands::Status => cmd_status(&workspace),
        Commands::Config => cmd_config(&workspace),
    }
}

fn cmd_init(workspace: &Workspace, force: bool) -> Result<()> {
    let config_path = workspace.config_path();
    if config_path.exists() && !force {
        println!("{} already exists, use --force to overwrite", config_path.display());
    } else {
        Config::default()
            .save(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Wrote default configuration to {}", config_path.display());
    }
    workspace
        .ensure_directories()
        .context("creating workspace directories")?;

    println!();
    println!("Next steps:");
    println!("  1. Edit config.yaml to match the recording setup");
    println!("  2. Put one \"x y\" line per channel in {COORDS_FILE}");
    println!("  3. Drop acquisition batches into acquisition/<block>/");
    println!("  4. Name the reference segment in {REFERENCE_FILE}, e.g. block_001/segment_001.bin");
    println!("  5. Run `realtime-mea start`");
    Ok(())
}

fn cmd_start(workspace: Workspace) -> Result<()> {
    println!("Realtime MEA v{VERSION}");
    println!();

    let mut driver = Driver::open(workspace.clone()).context("cannot start pipeline")?;
    let config = driver.config();
    println!("Workspace: {}", workspace.root().display());
    println!(
        "  Channels: {} at {} Hz",
        config.n_channels, config.sampling_frequency
    );
    println!("  Segment duration: {}s", config.raw_segment_duration_sec);
    println!("  Poll interval: {}s", config.poll_interval_secs);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    driver.run(&running);

    println!();
    println!("Stopping pipeline...");
    println!();
    println!("{}", driver.ledger().summary());
    Ok(())
}

fn cmd_tick(workspace: Workspace) -> Result<()> {
    let mut driver = Driver::open(workspace).context("cannot start pipeline")?;
    let report = driver.tick()?;

    for (block, segments) in &report.ingested {
        println!("ingested {block}: {segments} segments");
    }
    match &report.blocked {
        Some(Blocked::NoReference) => println!("waiting for {REFERENCE_FILE}"),
        Some(Blocked::ReferenceNotIngested(id)) => println!("waiting for reference segment {id}"),
        None => {}
    }
    for item in &report.completed {
        println!("completed {item}");
    }
    for (item, reason) in &report.failed {
        println!("failed {item}: {reason}");
    }
    if !report.did_work() && report.failed.is_empty() {
        println!("up to date");
    }
    Ok(())
}

fn cmd_status(workspace: &Workspace) -> Result<()> {
    println!("Realtime MEA Status");
    println!("===================");
    println!();

    let reference = match workspace.read_reference() {
        Ok(reference) => reference,
        Err(e) => {
            println!("Reference: invalid ({e})");
            None
        }
    };
    let snapshot = TreeSnapshot::capture(workspace, reference)?;
    match reference_gate(&snapshot) {
        Ok(status) => println!("Reference: {}", status.id),
        Err(Blocked::NoReference) => println!("Reference: not set"),
        Err(Blocked::ReferenceNotIngested(id)) => println!("Reference: {id} (not ingested yet)"),
    }
    println!();

    if snapshot.blocks.is_empty() {
        println!("No epoch blocks ingested.");
    } else {
        println!(
            "{:<24} {:>8} {:>6} {:>8} {:>6} {:>6} {:>7} {:>7}",
            "Block", "Segments", "Filt", "Shifted", "Stats", "Sorted", "Preview", "Epoch"
        );
        for block in &snapshot.blocks {
            let count = |f: fn(&SegmentStatus) -> bool| {
                block.segments.iter().filter(|s| f(s)).count()
            };
            println!(
                "{:<24} {:>8} {:>6} {:>8} {:>6} {:>6} {:>7} {:>7}",
                block.name,
                block.segments.len(),
                count(|s| s.filtered.is_complete()),
                count(|s| s.shifted.is_complete()),
                count(|s| s.stats.is_complete()),
                count(|s| s.spike_sorting.is_complete()),
                count(|s| s.preview.is_complete()),
                if block.epoch_sorting.is_complete() { "done" } else { "-" },
            );
        }
    }
    println!();

    let ledger_path = workspace.ledger_path();
    if ledger_path.exists() {
        println!("{}", RunLedger::with_persistence(ledger_path).summary());
    } else {
        println!("No previous run data found.");
    }
    Ok(())
}

fn cmd_config(workspace: &Workspace) -> Result<()> {
    let path = workspace.config_path();
    let config = if path.exists() {
        Config::load(&path)?
    } else {
        println!("# {} not found, showing defaults", path.display());
        Config::default()
    };

    println!("# Configuration");
    println!("# Config file: {}", path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
