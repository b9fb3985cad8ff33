//! Backup job executor - runs restic for one job with retries.
//!
//! Guarantees:
//! - at most one run per job at a time, across processes when a lock
//!   directory is set; a fire that arrives while the job is running is
//!   deferred to the job's next natural fire, never queued
//! - at most `max_concurrent` different jobs run at once; excess fires wait
//!   for a permit
//! - failed attempts are retried with exponential backoff and jitter until the
//!   attempt budget is spent

pub mod lock;
pub mod restic;
pub mod tracker;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{RunResult, RunStatus, Trigger, ValidJob};
use crate::utils::errors::CancellationError;
pub use lock::{JobLock, LockError};
pub use restic::{BackupOutput, ResticRunner, Runner};
pub use tracker::{JobState, JobTracker};

/// Capacity of the run-result broadcast channel.
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per fire, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            Duration::from_secs_f64(delay * (1.0 + rand::random::<f64>() * 0.25))
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// What happened to a fire event.
#[derive(Debug)]
pub enum FireOutcome {
    Completed(RunResult),
    /// The job was already running; nothing was started or queued
    Deferred,
}

impl FireOutcome {
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            FireOutcome::Completed(result) => Some(result),
            FireOutcome::Deferred => None,
        }
    }
}

struct Outcome {
    status: RunStatus,
    attempts: u32,
    output: Option<BackupOutput>,
    error_detail: Option<String>,
}

impl Outcome {
    fn failed(attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            attempts,
            output: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// Holds a job in `Running` for one fire. Dropping it without `finish`, as
/// when the fire's task is aborted, records the run as failed.
struct RunGuard<'a> {
    tracker: &'a JobTracker,
    name: &'a str,
    cancel: CancellationToken,
    done: bool,
}

impl<'a> RunGuard<'a> {
    fn start(tracker: &'a JobTracker, name: &'a str, parent: &CancellationToken) -> Option<Self> {
        let cancel = tracker.try_start(name, parent)?;
        Some(Self {
            tracker,
            name,
            cancel,
            done: false,
        })
    }

    fn finish(mut self, succeeded: bool) {
        self.done = true;
        self.tracker.finish(self.name, succeeded);
    }

    fn release(mut self) {
        self.done = true;
        self.tracker.release(self.name);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.finish(self.name, false);
        }
    }
}

/// Main backup executor
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn Runner>,
    retry: RetryPolicy,
    tracker: JobTracker,
    lock_dir: Option<PathBuf>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    results: broadcast::Sender<RunResult>,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn Runner>,
        retry: RetryPolicy,
        max_concurrent: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            runner,
            retry,
            tracker: JobTracker::new(),
            lock_dir: None,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            shutdown,
            results,
        }
    }

    /// Also serialize runs against other processes through lock files in `dir`
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// Receive every `RunResult` produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunResult> {
        self.results.subscribe()
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Cancel a running job by name
    pub fn cancel(&self, name: &str) -> bool {
        self.tracker.cancel(name)
    }

    fn lock(&self, name: &str) -> Result<Option<JobLock>, LockError> {
        match &self.lock_dir {
            Some(dir) => lock::try_lock(dir, name).map(Some),
            None => Ok(None),
        }
    }

    /// Execute one fire event for `job`
    pub async fn fire(&self, job: &ValidJob, trigger: Trigger) -> FireOutcome {
        let Some(guard) = RunGuard::start(&self.tracker, &job.name, &self.shutdown) else {
            warn!(job = %job.name, ?trigger, "Skipping run: job already running");
            return FireOutcome::Deferred;
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let lock = match self.lock(&job.name) {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                guard.release();
                warn!(job = %job.name, ?trigger, "Skipping run: job running in another process");
                return FireOutcome::Deferred;
            }
            Err(e) => {
                guard.finish(false);
                let outcome = Outcome::failed(0, e.to_string());
                return self.complete(job, trigger, run_id, started_at, clock, outcome);
            }
        };

        let outcome = self.run(job, &guard.cancel, run_id).await;
        drop(lock);
        guard.finish(outcome.status != RunStatus::Failure);

        self.complete(job, trigger, run_id, started_at, clock, outcome)
    }

    fn complete(
        &self,
        job: &ValidJob,
        trigger: Trigger,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        clock: Instant,
        outcome: Outcome,
    ) -> FireOutcome {
        let result = RunResult {
            run_id,
            job: job.name.clone(),
            status: outcome.status,
            trigger,
            started_at,
            duration: clock.elapsed(),
            attempts: outcome.attempts,
            bytes_transferred: outcome.output.as_ref().and_then(|o| o.bytes_added),
            snapshot_id: outcome.output.and_then(|o| o.snapshot_id),
            error_detail: outcome.error_detail,
        };

        match result.status {
            RunStatus::Success => info!(
                job = %result.job,
                %run_id,
                attempts = result.attempts,
                bytes = ?result.bytes_transferred,
                duration_ms = result.duration.as_millis() as u64,
                "Backup completed"
            ),
            RunStatus::Partial => warn!(
                job = %result.job,
                %run_id,
                detail = ?result.error_detail,
                "Backup completed with warnings"
            ),
            RunStatus::Failure => error!(
                job = %result.job,
                %run_id,
                attempts = result.attempts,
                detail = ?result.error_detail,
                "Backup failed"
            ),
        }

        // no subscribers is fine
        let _ = self.results.send(result.clone());
        FireOutcome::Completed(result)
    }

    async fn run(&self, job: &ValidJob, cancel: &CancellationToken, run_id: Uuid) -> Outcome {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => return Outcome::failed(0, format!("executor closed: {}", e)),
            },
            _ = cancel.cancelled() => {
                return Outcome::failed(0, CancellationError::cancelled().to_string());
            }
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(job = %job.name, %run_id, attempt, max_attempts, "Starting backup attempt");

            let error = match self.runner.backup(job, cancel).await {
                Ok(output) => return self.finish_success(job, cancel, attempt, output).await,
                Err(e) => e,
            };

            // cancellation is never retryable
            if !error.is_retryable() || attempt >= max_attempts {
                return Outcome::failed(attempt, error.to_string());
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                job = %job.name,
                %run_id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Backup attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Outcome::failed(attempt, CancellationError::cancelled().to_string());
                }
            }
        }
    }

    async fn finish_success(
        &self,
        job: &ValidJob,
        cancel: &CancellationToken,
        attempts: u32,
        output: BackupOutput,
    ) -> Outcome {
        if output.partial {
            let detail = if output.stderr.is_empty() {
                "snapshot is missing some source files".to_string()
            } else {
                output.stderr.clone()
            };
            return Outcome {
                status: RunStatus::Partial,
                attempts,
                output: Some(output),
                error_detail: Some(detail),
            };
        }

        if !job.retention.is_empty() {
            if let Err(e) = self.runner.forget(job, cancel).await {
                let status = if e.is_cancelled() {
                    RunStatus::Failure
                } else {
                    RunStatus::Partial
                };
                return Outcome {
                    status,
                    attempts,
                    output: Some(output),
                    error_detail: Some(format!("forget failed: {}", e)),
                };
            }
        }

        Outcome {
            status: RunStatus::Success,
            attempts,
            output: Some(output),
            error_detail: None,
        }
    }
}
