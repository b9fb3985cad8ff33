//! restic-agent - main entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use restic_agent::executor::{Executor, FireOutcome, ResticRunner};
use restic_agent::model::{load_jobs, BackupJob, RunStatus, Trigger};
use restic_agent::reconcile::{run_pass, validate_all, PassOptions, PassReport};
use restic_agent::report::{read_history, Reporter};
use restic_agent::validate::validate;
use restic_agent::{config::Config, daemon, daemon::shutdown::ShutdownCoordinator, platform, utils, AgentError};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Jobs file (overrides agent.jobs_file)
    #[arg(short, long, value_name = "FILE", global = true)]
    jobs: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the jobs file and report every invalid job
    Validate,
    /// Show the actions a reconciliation pass would take
    Plan,
    /// Run one reconciliation pass
    Apply,
    /// Run one backup job now
    Run {
        /// Job name
        job: String,
    },
    /// Reconcile periodically and run jobs on schedule
    Daemon,
    /// Show recent runs
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(jobs) = args.jobs {
        config.agent.jobs_file = jobs;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log)?;

    tracing::debug!(
        "Starting restic-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    match args.command {
        Command::Validate => validate_jobs(&config),
        Command::Plan => pass(&config, args.config.as_deref(), true).await,
        Command::Apply => pass(&config, args.config.as_deref(), false).await,
        Command::Run { job } => run_job(&config, &job).await,
        Command::Daemon => Ok(daemon::run(config, args.config.as_deref()).await?),
        Command::History { limit } => history(&config, limit).await,
    }
}

fn load(config: &Config) -> Result<Vec<BackupJob>> {
    load_jobs(&config.agent.jobs_file)
        .with_context(|| format!("failed to load {}", config.agent.jobs_file.display()))
}

fn validate_jobs(config: &Config) -> Result<()> {
    let jobs = load(config)?;
    let (desired, invalid) = validate_all(&jobs);

    for name in desired.keys() {
        println!("ok       {}", name);
    }
    for (name, error) in &invalid {
        println!("invalid  {}: {}", name, error);
    }

    if !invalid.is_empty() {
        bail!("{} of {} jobs are invalid", invalid.len(), jobs.len());
    }
    Ok(())
}

async fn pass(config: &Config, config_path: Option<&std::path::Path>, dry_run: bool) -> Result<()> {
    let jobs = load(config)?;
    let backend = platform::select_scheduler(config, config_path, None)?;
    let platform = platform::build(config, backend)?;

    let report = run_pass(&jobs, &platform, PassOptions { dry_run }).await?;
    print_report(&report);

    match &report.applied {
        Some(applied) if !applied.is_success() => {
            bail!("{} of {} actions failed", applied.failed.len(), report.plan.len())
        }
        _ => Ok(()),
    }
}

fn print_report(report: &PassReport) {
    for (name, error) in &report.invalid {
        println!("invalid      {}: {}", name, error);
    }
    for uri in &report.unreachable {
        println!("unreachable  {}", uri);
    }

    match &report.applied {
        None if report.plan.is_empty() => println!("up to date"),
        None => {
            for action in report.plan.iter() {
                println!("{}", action);
            }
        }
        Some(applied) => {
            for action in &applied.applied {
                println!("applied      {}", action);
            }
            for failure in &applied.failed {
                println!("failed       {}: {}", failure.action, failure.error);
            }
            for action in &applied.skipped {
                println!("skipped      {}", action);
            }
        }
    }
}

async fn run_job(config: &Config, name: &str) -> Result<()> {
    let jobs = load(config)?;
    let raw = jobs
        .iter()
        .find(|job| job.name == name)
        .ok_or_else(|| AgentError::UnknownJob(name.to_string()))?;
    let job = validate(raw)?;

    let coordinator = ShutdownCoordinator::new();
    let executor = Executor::new(
        Arc::new(ResticRunner::from_config(config)),
        config.scheduler.retry_policy(),
        1,
        coordinator.token(),
    )
    .with_lock_dir(config.lock_dir());

    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };

    let outcome = executor.fire(&job, Trigger::Manual).await;
    signals.abort();

    let FireOutcome::Completed(result) = outcome else {
        bail!("job {} is already running", name);
    };

    Reporter::new(config.history_file()).record(&result).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.status == RunStatus::Failure {
        bail!("job {} failed", name);
    }
    Ok(())
}

async fn history(config: &Config, limit: usize) -> Result<()> {
    let results = read_history(&config.history_file(), limit).await?;
    if results.is_empty() {
        println!("no runs recorded in {}", config.history_file().display());
    }
    for result in results {
        println!(
            "{}  {:<20} {:<8} attempts={} {}",
            result.started_at.format("%Y-%m-%d %H:%M:%S"),
            result.job,
            format!("{:?}", result.status).to_lowercase(),
            result.attempts,
            result.error_detail.unwrap_or_default()
        );
    }
    Ok(())
}
