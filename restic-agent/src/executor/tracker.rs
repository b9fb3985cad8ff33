//! Per-job run state and cancellation handles.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// `Idle -> Running -> {Succeeded, Failed}`; the last two are idle again for
/// the purpose of starting a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct TrackedJob {
    state: JobState,
    cancel: Option<CancellationToken>,
}

/// Tracks which jobs are running and lets them be cancelled
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, TrackedJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TrackedJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TrackedJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a job to `Running`. Returns `None` if it already is; the caller
    /// must not start a second run. The token is a child of `parent`.
    pub fn try_start(&self, name: &str, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut jobs = self.write();
        let entry = jobs.entry(name.to_string()).or_insert(TrackedJob {
            state: JobState::Idle,
            cancel: None,
        });
        if entry.state == JobState::Running {
            return None;
        }
        let token = parent.child_token();
        entry.state = JobState::Running;
        entry.cancel = Some(token.clone());
        Some(token)
    }

    /// Record the outcome of the current run
    pub fn finish(&self, name: &str, succeeded: bool) {
        let mut jobs = self.write();
        if let Some(entry) = jobs.get_mut(name) {
            entry.state = if succeeded {
                JobState::Succeeded
            } else {
                JobState::Failed
            };
            entry.cancel = None;
        }
    }

    /// Return a job to `Idle` without recording an outcome
    pub fn release(&self, name: &str) {
        let mut jobs = self.write();
        if let Some(entry) = jobs.get_mut(name) {
            entry.state = JobState::Idle;
            entry.cancel = None;
        }
    }

    /// Cancel a running job by name
    pub fn cancel(&self, name: &str) -> bool {
        let jobs = self.read();
        match jobs.get(name).and_then(|entry| entry.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, name: &str) -> JobState {
        let jobs = self.read();
        jobs.get(name).map(|entry| entry.state).unwrap_or(JobState::Idle)
    }

    /// Drop bookkeeping for a job that is no longer scheduled. Running jobs are kept.
    pub fn remove(&self, name: &str) {
        let mut jobs = self.write();
        if jobs.get(name).is_some_and(|entry| entry.state != JobState::Running) {
            jobs.remove(name);
        }
    }

    /// Get count of running jobs
    pub fn running_count(&self) -> usize {
        let jobs = self.read();
        jobs.values().filter(|entry| entry.state == JobState::Running).count()
    }
}
