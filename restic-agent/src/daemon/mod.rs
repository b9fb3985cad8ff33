//! Long-running agent: periodic reconciliation plus the in-process scheduler.

pub mod shutdown;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::executor::{Executor, ResticRunner};
use crate::model::load_jobs;
use crate::platform::{self, ConfigStore, Platform};
use crate::reconcile::{run_pass, PassOptions};
use crate::report::Reporter;
use crate::scheduler::Scheduler;
use crate::Result;
use shutdown::ShutdownCoordinator;

/// Extra time on top of the grace period for runs to report after cancellation.
const DRAIN_SLACK: Duration = Duration::from_secs(10);

/// Run until SIGTERM/SIGINT.
pub async fn run(config: Config, config_path: Option<&Path>) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    let shutdown = coordinator.token();

    let runner = Arc::new(ResticRunner::from_config(&config));
    let executor = Executor::new(
        runner,
        config.scheduler.retry_policy(),
        config.scheduler.max_concurrent_jobs,
        shutdown.child_token(),
    )
    .with_lock_dir(config.lock_dir());

    // the reporter outlives the executor so late results are still recorded
    let reporter_stop = CancellationToken::new();
    let reporter = Reporter::new(config.history_file()).spawn(executor.subscribe(), reporter_stop.clone());

    let agent = Arc::new(
        Scheduler::new(
            executor.clone(),
            ConfigStore::new(config.platform.config_dir.clone()),
        )
        .await?,
    );
    let backend = platform::select_scheduler(&config, config_path, Some(agent.clone()))?;
    let platform = platform::build(&config, backend)?;
    agent.start().await?;

    info!(
        agent_id = %config.agent.id,
        platform = %platform.describe(),
        jobs_file = %config.agent.jobs_file.display(),
        interval_secs = config.agent.reconcile_interval_secs,
        "Agent started"
    );

    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.wait_for_signal().await {
                error!(error = %e, "Failed to install signal handlers, shutting down");
                coordinator.trigger();
            }
        })
    };

    reconcile_loop(&config, &platform, &shutdown).await;

    info!("Graceful shutdown initiated");
    if let Err(e) = agent.shutdown().await {
        warn!(error = %e, "Scheduler shutdown failed");
    }
    drain(&executor, config.scheduler.grace_period() + DRAIN_SLACK).await;

    reporter_stop.cancel();
    if let Err(e) = reporter.await {
        error!(error = %e, "Reporter task panicked");
    }
    signals.abort();

    info!("Graceful shutdown complete");
    Ok(())
}

async fn reconcile_loop(config: &Config, platform: &Platform, shutdown: &CancellationToken) {
    let period = Duration::from_secs(config.agent.reconcile_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        reconcile_once(config, platform).await;
    }
}

/// One pass against the current jobs file. Failures are logged; the next tick retries.
pub async fn reconcile_once(config: &Config, platform: &Platform) {
    let jobs = match load_jobs(&config.agent.jobs_file) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "Failed to load jobs file, keeping current schedules");
            return;
        }
    };

    match run_pass(&jobs, platform, PassOptions::default()).await {
        Ok(report) => {
            if let Some(applied) = &report.applied {
                if applied.is_success() {
                    info!(applied = applied.applied.len(), "Reconciliation applied");
                } else {
                    warn!(
                        applied = applied.applied.len(),
                        failed = applied.failed.len(),
                        skipped = applied.skipped.len(),
                        "Reconciliation partially applied"
                    );
                }
            }
        }
        Err(e) => error!(error = %e, "Reconciliation pass abandoned"),
    }
}

/// Wait for cancelled runs to finish, up to `timeout`.
async fn drain(executor: &Executor, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let running = executor.tracker().running_count();
        if running == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(running, "Shutdown timeout with backups still running");
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{self, MemoryPackages, MemoryScheduler};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reconcile_once_applies_jobs_file() {
        let temp_dir = TempDir::new().unwrap();
        let jobs_file = temp_dir.path().join("jobs.toml");
        std::fs::write(
            &jobs_file,
            r#"
[jobs.daily]
paths = ["/var/backups"]
repository = "s3:s3.amazonaws.com/bucket_backups"
schedule = "0 2 * * *"
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.agent.jobs_file = jobs_file;
        let scheduler = Arc::new(MemoryScheduler::default());
        let packages = Arc::new(MemoryPackages {
            version: Mutex::new(Some("0.17.3".to_string())),
            broken: false,
        });
        let platform = memory::platform(packages, scheduler.clone());

        reconcile_once(&config, &platform).await;
        assert_eq!(scheduler.entries.lock().unwrap()["daily"].schedule, "0 2 * * *");
    }

    #[tokio::test]
    async fn test_broken_jobs_file_keeps_schedules() {
        let temp_dir = TempDir::new().unwrap();
        let jobs_file = temp_dir.path().join("jobs.toml");
        std::fs::write(&jobs_file, "[jobs.daily\n").unwrap();

        let mut config = Config::default();
        config.agent.jobs_file = jobs_file;
        let mut entries = std::collections::BTreeMap::new();
        entries.insert(
            "daily".to_string(),
            crate::model::ScheduledEntry {
                schedule: "@daily".to_string(),
                config: None,
            },
        );
        let scheduler = Arc::new(MemoryScheduler::with_entries(entries));
        let platform = memory::platform(Arc::new(MemoryPackages::default()), scheduler.clone());

        reconcile_once(&config, &platform).await;
        assert!(scheduler.entries.lock().unwrap().contains_key("daily"));
    }
}
