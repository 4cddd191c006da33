//! ModSync Agent - Main entry point
//!
//! Synchronizes a local mod folder with a ModSync file server.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use modsync_agent::cancel::cancel_on_signal;
use modsync_agent::transfer::progress::{
    format_bytes, format_duration, format_speed, ProgressTracker,
};
use modsync_agent::{utils, Config, EventSink, SyncEvent, SyncOrchestrator, SyncOutcome};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring ROOT in line with the server's manifest
    Sync {
        root: PathBuf,

        /// Only report what would change
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore ROOT from its most recent backup snapshot
    Rollback { root: PathBuf },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting modsync-agent v{} (server: {})",
        env!("CARGO_PKG_VERSION"),
        config.server.url
    );

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Rollback { root } => {
            let orchestrator = SyncOrchestrator::new(config)?;
            let report = orchestrator.rollback(&root).await?;
            println!(
                "Restored {}/{} files, removed {} created files",
                report.restored, report.total, report.removed
            );
            report.into_result()?;
            Ok(())
        }
        Command::Sync { root, dry_run } => run_sync(config, root, dry_run).await,
    }
}

async fn run_sync(config: Config, root: PathBuf, dry_run: bool) -> Result<()> {
    let orchestrator = SyncOrchestrator::new(config)?;
    let signals = cancel_on_signal(orchestrator.cancel_handle());

    let (sink, rx) = EventSink::channel();
    let renderer = tokio::spawn(render_events(rx));

    let result = orchestrator.sync(&root, dry_run, sink).await;
    signals.abort();
    // The sink was moved into `sync`, so the renderer drains and stops
    let _ = renderer.await;

    let report = result?;
    if dry_run {
        for key in &report.diff.to_delete {
            println!("delete  {}", key);
        }
        for key in &report.diff.to_fetch {
            println!("fetch   {}", key);
        }
    }

    println!(
        "{:?}: {} deleted, {} downloaded ({}), {} unchanged, {} already complete in {}",
        report.outcome,
        report.deleted_count,
        report.downloaded_count,
        format_bytes(report.total_bytes_downloaded),
        report.unchanged_count,
        report.skipped_count,
        format_duration(report.duration.as_secs())
    );
    if let Some(restore) = &report.restore {
        println!("Rollback restored {}/{} files", restore.restored, restore.total);
    }

    match report.outcome {
        SyncOutcome::Completed | SyncOutcome::DryRun => Ok(()),
        SyncOutcome::Cancelled => bail!("sync cancelled"),
        SyncOutcome::RolledBack => bail!(
            "sync failed and was rolled back: {}",
            report.error.unwrap_or_default()
        ),
        SyncOutcome::RollbackIncomplete => bail!(
            "sync stopped and rollback was incomplete: {}",
            report.error.unwrap_or_default()
        ),
    }
}

async fn render_events(mut rx: UnboundedReceiver<SyncEvent>) {
    let mut tracker = ProgressTracker::new();
    while let Some(event) = rx.recv().await {
        let progress = tracker.apply(&event).clone();
        match event {
            SyncEvent::PassStarted {
                total_bytes,
                files_to_fetch,
                files_to_delete,
            } => tracing::info!(
                "Fetching {} files ({}), deleting {}",
                files_to_fetch,
                format_bytes(total_bytes),
                files_to_delete
            ),
            SyncEvent::FileStarted { path, size } => {
                tracing::debug!("-> {} ({})", path, format_bytes(size))
            }
            SyncEvent::FileProgress { .. } => tracing::info!(
                "{:.1}% {} / {} at {}, ETA {} [{}/{} files]",
                progress.percent(),
                format_bytes(progress.received_bytes),
                format_bytes(progress.fetch_bytes),
                format_speed(progress.speed),
                progress.eta_secs.map(format_duration).unwrap_or_else(|| "-".to_string()),
                progress.files_done,
                progress.files_total
            ),
            SyncEvent::FileFailed { path, error } => tracing::warn!("{} failed: {}", path, error),
            SyncEvent::PassCompleted { .. } => tracing::info!(
                "Average speed {}",
                format_speed(tracker.average_speed())
            ),
            SyncEvent::FileCompleted { .. }
            | SyncEvent::FileDeleted { .. }
            | SyncEvent::PassFailed { .. } => {}
        }
    }
}
