//! In-process scheduler backend.
//!
//! Registers `tokio-cron-scheduler` jobs for each backup job, one per
//! normalized cron form. Each fire goes through the [`Executor`], which
//! enforces per-job serialization and the global concurrency limit.
//! Schedules are evaluated in the host's local time, like systemd and cron.

use async_trait::async_trait;
use chrono::Local;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

use crate::executor::Executor;
use crate::model::{ScheduledEntry, Trigger, ValidJob};
use crate::platform::{ConfigStore, SchedulerBackend};
use crate::utils::errors::ReconciliationError;
use crate::Result;

struct Registration {
    ids: Vec<Uuid>,
    schedule: String,
}

pub struct Scheduler {
    scheduler: Mutex<JobScheduler>,
    executor: Executor,
    configs: ConfigStore,
    registered: Mutex<HashMap<String, Registration>>,
}

impl Scheduler {
    pub async fn new(executor: Executor, configs: ConfigStore) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            executor,
            configs,
            registered: Mutex::new(HashMap::new()),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }

    /// Names of the registered jobs, sorted
    pub async fn jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registered.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of cron jobs registered for `name`
    pub async fn registrations(&self, name: &str) -> usize {
        self.registered
            .lock()
            .await
            .get(name)
            .map_or(0, |registration| registration.ids.len())
    }

    fn cron_jobs(&self, job: &ValidJob) -> Result<Vec<Job>> {
        let job = Arc::new(job.clone());
        let mut cron_jobs = Vec::new();
        for expression in job.schedule.normalized() {
            let executor = self.executor.clone();
            let job = job.clone();
            let cron_job = Job::new_async_tz(expression.as_str(), Local, move |_uuid, _lock| {
                let executor = executor.clone();
                let job = job.clone();
                Box::pin(async move {
                    debug!(job = %job.name, "Schedule fired");
                    let _ = executor.fire(&job, Trigger::Schedule).await;
                })
            })?;
            cron_jobs.push(cron_job);
        }
        Ok(cron_jobs)
    }

    async fn deregister(&self, name: &str) -> Result<()> {
        let previous = self.registered.lock().await.remove(name);
        if let Some(previous) = previous {
            let scheduler = self.scheduler.lock().await;
            for id in &previous.ids {
                scheduler.remove(id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerBackend for Scheduler {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn list(&self) -> std::result::Result<BTreeMap<String, ScheduledEntry>, ReconciliationError> {
        let err = |e: std::io::Error| ReconciliationError::ScheduledEntries(e.to_string());

        let schedules: Vec<(String, String)> = self
            .registered
            .lock()
            .await
            .iter()
            .map(|(name, registration)| (name.clone(), registration.schedule.clone()))
            .collect();

        let mut entries = BTreeMap::new();
        for (name, schedule) in schedules {
            let config = self.configs.read(&name).await.map_err(err)?;
            entries.insert(name, ScheduledEntry { schedule, config });
        }
        // configs left by a previous daemon have nothing registered yet
        for name in self.configs.names().await.map_err(err)? {
            if !entries.contains_key(&name) {
                let config = self.configs.read(&name).await.map_err(err)?;
                entries.insert(name, ScheduledEntry { schedule: String::new(), config });
            }
        }
        Ok(entries)
    }

    async fn write_config(&self, job: &ValidJob) -> Result<()> {
        self.configs.write(job).await?;
        Ok(())
    }

    async fn schedule(&self, job: &ValidJob) -> Result<()> {
        self.deregister(&job.name).await?;

        let cron_jobs = self.cron_jobs(job)?;
        let mut ids = Vec::with_capacity(cron_jobs.len());
        {
            let scheduler = self.scheduler.lock().await;
            for cron_job in cron_jobs {
                ids.push(scheduler.add(cron_job).await?);
            }
        }
        self.registered.lock().await.insert(
            job.name.clone(),
            Registration {
                ids,
                schedule: job.schedule.expression().to_string(),
            },
        );

        info!(job = %job.name, schedule = %job.schedule, "Job scheduled");
        Ok(())
    }

    async fn unschedule(&self, name: &str) -> Result<()> {
        self.deregister(name).await?;
        self.configs.remove(name).await?;
        self.executor.tracker().remove(name);
        info!(job = %name, "Job unscheduled");
        Ok(())
    }
}
