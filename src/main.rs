mod adapter;
mod browser;
mod config;
mod db;
mod dedup;
mod error;
mod job;
mod record;
mod scheduler;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::browser::ChromiumEngine;
use crate::config::PipelineConfig;
use crate::scheduler::{RunResult, Scheduler};

#[derive(Parser)]
#[command(name = "vessel_scraper", about = "Scheduled vessel-position scraper")]
struct Cli {
    /// Path to the pipeline config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and register configured targets
    Init,
    /// Trigger one run for a target (default: all due targets)
    Run {
        /// Target id to run; omit to run everything that is due
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Poll on an interval and trigger due targets until interrupted
    Watch,
    /// Per-target run state (last success, failures, disabled flag)
    Status,
    /// Re-enable a target after auto-disable
    Enable { target: String },
    /// Disable a target (operator override)
    Disable { target: String },
    /// Export the position store to CSV
    Export {
        /// Restrict to one target id
        #[arg(short, long)]
        target: Option<String>,
        /// Output file
        #[arg(short, long, default_value = "positions.csv")]
        out: PathBuf,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let config = Arc::new(PipelineConfig::load(&cli.config)?);
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&config),
        Arc::new(ChromiumEngine::new()),
    ));

    let result = match cli.command {
        Commands::Init => {
            scheduler.initialize()?;
            println!("Initialized schema and {} targets", config.targets.len());
            Ok(())
        }
        Commands::Run { target } => {
            scheduler.initialize()?;
            let targets = match target {
                Some(id) => {
                    let t = config
                        .target(&id)
                        .ok_or_else(|| anyhow::anyhow!("Unknown target '{}'", id))?;
                    vec![t.clone()]
                }
                None => {
                    let due = scheduler.due_targets(Utc::now())?;
                    if due.is_empty() {
                        println!("No targets due. Use --target to force a run.");
                        return Ok(());
                    }
                    due
                }
            };
            run_targets(&scheduler, targets).await;
            Ok(())
        }
        Commands::Watch => {
            scheduler.initialize()?;
            watch(&scheduler, config.poll_interval_secs).await;
            Ok(())
        }
        Commands::Status => {
            let conn = db::connect(&config.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_status(&conn)?;
            if rows.is_empty() {
                println!("No run state recorded. Run 'init' first.");
                return Ok(());
            }
            println!(
                "{:<16} | {:>9} | {:<20} | {:>8} | {:>7} | {:<8} | {}",
                "Target", "Positions", "Last success", "Failures", "Backoff", "Disabled", "Last error"
            );
            println!("{}", "-".repeat(110));
            for row in rows {
                let s = &row.state;
                println!(
                    "{:<16} | {:>9} | {:<20} | {:>8} | {:>7} | {:<8} | {}",
                    truncate(&s.target_id, 16),
                    row.positions,
                    s.last_success
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".into()),
                    s.consecutive_failures,
                    s.backoff_remaining,
                    if s.disabled { "yes" } else { "no" },
                    truncate(s.last_error.as_deref().unwrap_or("-"), 40),
                );
            }
            Ok(())
        }
        Commands::Enable { target } => {
            scheduler.set_enabled(&target, true)?;
            println!("Target '{}' enabled", target);
            Ok(())
        }
        Commands::Disable { target } => {
            scheduler.set_enabled(&target, false)?;
            println!("Target '{}' disabled", target);
            Ok(())
        }
        Commands::Export { target, out } => {
            let conn = db::connect(&config.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::export_csv(&conn, target.as_deref(), &out)?;
            println!("Exported {} rows to {}", rows, out.display());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&config.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Positions:    {}", s.positions);
            println!("Fingerprints: {}", s.fingerprints);
            println!("Targets:      {}", s.targets_tracked);
            println!("Disabled:     {}", s.targets_disabled);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Run the given targets concurrently, one job per target, and summarize.
async fn run_targets(scheduler: &Arc<Scheduler>, targets: Vec<config::TargetConfig>) {
    let pb = ProgressBar::new(targets.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for target in targets {
        let scheduler = Arc::clone(scheduler);
        tasks.spawn(async move {
            let id = target.id.clone();
            (id, scheduler.run(&target).await)
        });
    }

    let mut completed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    let mut new_records = 0usize;

    while let Some(joined) = tasks.join_next().await {
        pb.inc(1);
        let Ok((id, result)) = joined else {
            failed += 1;
            continue;
        };
        match result {
            Ok(RunResult::Completed { new_records: n, .. }) => {
                completed += 1;
                new_records += n;
                pb.set_message(format!("{}: +{}", id, n));
            }
            Ok(RunResult::Skipped(reason)) => {
                skipped += 1;
                pb.set_message(format!("{}: skipped ({})", id, reason));
            }
            Ok(RunResult::Failed { error, .. }) => {
                failed += 1;
                pb.set_message(format!("{}: failed", id));
                warn!("[{}] {}", id, error);
            }
            Err(e) => {
                failed += 1;
                warn!("[{}] infrastructure error: {}", id, e);
            }
        }
    }

    pb.finish_and_clear();
    println!(
        "Runs: {} completed, {} skipped, {} failed. {} new records.",
        completed, skipped, failed, new_records
    );
}

/// Timer loop for unattended operation. Each cycle triggers every due
/// target; an external cron invoking 'run' is equivalent.
async fn watch(scheduler: &Arc<Scheduler>, poll_interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval_secs));
    info!("Watching {} targets (poll every {}s)", scheduler.config().targets.len(), poll_interval_secs);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
        let due = match scheduler.due_targets(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                warn!("Failed to compute due targets: {}", e);
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }
        info!("{} targets due", due.len());
        run_targets(scheduler, due).await;
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
