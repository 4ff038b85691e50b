//! StockFlow CLI — run and inspect the daily price pipeline.
//!
//! Commands:
//! - `scheduler` — execute the latest due interval, then wait for the next one
//! - `trigger` — execute one run date, or a range of dates in parallel
//! - `resume` — continue a failed run at its failing node
//! - `status` — show the most recent runs with per-node attempts

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockflow_runner::{Orchestrator, PipelineConfig, PipelineRun, RunLedger, RunState};

#[derive(Parser)]
#[command(
    name = "stockflow",
    about = "StockFlow — daily stock price ingestion pipeline"
)]
struct Cli {
    /// Path to the pipeline TOML config.
    #[arg(long, global = true, default_value = "stockflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the latest due interval, then keep ticking at each UTC midnight.
    Scheduler {
        /// Tick once and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Execute the pipeline for a run date (YYYY-MM-DD).
    Trigger {
        #[arg(long)]
        date: String,

        /// Last run date of an inclusive range; dates run in parallel.
        #[arg(long)]
        to: Option<String>,
    },
    /// Continue a failed, cancelled or interrupted run at its failing node.
    Resume {
        #[arg(long)]
        date: String,
    },
    /// Show the most recent runs.
    Status {
        /// Number of run dates to show.
        #[arg(long, default_value_t = 10)]
        last: usize,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Scheduler { once } => run_scheduler(&cli.config, once)?,
        Commands::Trigger { date, to } => run_trigger(&cli.config, &date, to.as_deref())?,
        Commands::Resume { date } => run_resume(&cli.config, &date)?,
        Commands::Status { last } => run_status(&cli.config, last)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stockflow_core=info,stockflow_runner=info,stockflow_cli=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(config_path: &Path) -> Result<Orchestrator> {
    let config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    Ok(Orchestrator::from_config(&config)?)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

/// Longest uninterrupted sleep while waiting for the next tick.
const SLEEP_STEP: Duration = Duration::from_secs(1);

/// First Ctrl-C cancels: runs stop before their next node and the scheduler
/// exits. A second one exits immediately.
fn cancel_on_interrupt(cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("interrupt received; stopping after the current node");
    })
    .context("installing Ctrl-C handler")
}

fn run_scheduler(config_path: &Path, once: bool) -> Result<bool> {
    let orchestrator = load(config_path)?;
    let cancel = orchestrator.cancel_handle();
    cancel_on_interrupt(Arc::clone(&cancel))?;
    info!(
        symbol = orchestrator.symbol(),
        start = %orchestrator.schedule().start_date(),
        "scheduler started"
    );

    let mut ok = true;
    loop {
        ok &= tick_once(&orchestrator, Utc::now());
        if once || cancel.load(Ordering::SeqCst) {
            break;
        }

        let next = orchestrator.schedule().next_tick(Utc::now());
        info!(%next, "sleeping until next tick");
        if !sleep_until(next, &cancel) {
            break;
        }
    }
    info!("scheduler stopped");
    Ok(ok)
}

/// One scheduler tick. Failures are logged and reported as `false`; they
/// never end the scheduler loop.
fn tick_once(orchestrator: &Orchestrator, now: DateTime<Utc>) -> bool {
    match orchestrator.tick(now) {
        Ok(Some(pr)) => {
            print_run(&pr);
            pr.state == RunState::Succeeded
        }
        Ok(None) => {
            info!("nothing due");
            true
        }
        Err(e) => {
            error!(error = %e, "tick failed; retrying at the next interval");
            false
        }
    }
}

/// Sleep until `deadline`. Returns `false` as soon as `cancel` is set.
fn sleep_until(deadline: DateTime<Utc>, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(SLEEP_STEP));
    }
}

fn run_trigger(config_path: &Path, date: &str, to: Option<&str>) -> Result<bool> {
    let from = parse_date(date)?;
    let to = to.map(parse_date).transpose()?.unwrap_or(from);
    if to < from {
        bail!("--to {to} is before --date {from}");
    }

    let orchestrator = load(config_path)?;
    cancel_on_interrupt(orchestrator.cancel_handle())?;
    let mut runs = Vec::new();
    let mut day = from;
    while day <= to {
        runs.push(orchestrator.logical_run(day)?);
        day = day
            .checked_add_days(Days::new(1))
            .context("date range overflows the calendar")?;
    }

    let mut ok = true;
    for (run, result) in orchestrator.trigger_many(runs) {
        match result {
            Ok(pr) => {
                print_run(&pr);
                ok &= pr.state == RunState::Succeeded;
            }
            Err(e) => {
                warn!(run = %run, error = %e, "run not executed");
                eprintln!("{run}: {e}");
                ok = false;
            }
        }
    }
    Ok(ok)
}

fn run_resume(config_path: &Path, date: &str) -> Result<bool> {
    let orchestrator = load(config_path)?;
    cancel_on_interrupt(orchestrator.cancel_handle())?;
    let run = orchestrator.logical_run(parse_date(date)?)?;
    let pr = orchestrator.resume(run)?;
    print_run(&pr);
    Ok(pr.state == RunState::Succeeded)
}

fn run_status(config_path: &Path, last: usize) -> Result<bool> {
    let config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let ledger = RunLedger::open(&config.ledger.path);
    let runs = ledger.recent(&config.symbol(), last)?;

    if runs.is_empty() {
        println!("No runs recorded in {}", config.ledger.path.display());
        return Ok(true);
    }

    println!(
        "{:<8} {:<12} {:<10} {:<10} {:>5} {:>8}  {}",
        "Symbol", "Run Date", "State", "Trigger", "Exec", "Retries", "Failing Node"
    );
    println!("{}", "-".repeat(72));
    for pr in &runs {
        println!(
            "{:<8} {:<12} {:<10} {:<10} {:>5} {:>8}  {}",
            pr.run.symbol,
            pr.run.run_date.to_string(),
            pr.state,
            pr.trigger,
            pr.execution,
            pr.total_retries(),
            pr.failed_task.map_or_else(|| "-".to_string(), |t| t.to_string()),
        );
        let attempts: Vec<String> = pr
            .tasks
            .iter()
            .filter(|t| t.attempts > 0)
            .map(|t| format!("{}={}", t.task, t.attempts))
            .collect();
        println!("{:>22} {}", "attempts:", attempts.join(" "));
        if let Some((_, err)) = pr.failure() {
            println!("{:>22} {err}", "error:");
        }
    }
    Ok(true)
}

fn print_run(pr: &PipelineRun) {
    println!();
    println!("=== {} ===", pr.run);
    println!("State:      {}", pr.state);
    println!("Trigger:    {} (execution {})", pr.trigger, pr.execution);
    if let Some(rows) = pr.artifacts.rows_loaded {
        println!("Rows:       {}", rows.0);
    }
    if let Some(key) = &pr.artifacts.formatted_key {
        println!("Formatted:  {key}");
    }
    println!();
    println!("{:<12} {:<10} {:>8} {:>8}", "Node", "State", "Attempts", "Retries");
    for task in &pr.tasks {
        println!(
            "{:<12} {:<10} {:>8} {:>8}",
            task.task.as_label(),
            task.state.as_label(),
            task.attempts,
            task.retries()
        );
    }
    if let Some((task, err)) = pr.failure() {
        println!();
        println!("Failed at {task}: {err}");
    }
}
