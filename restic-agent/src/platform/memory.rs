//! In-memory platform for exercising the reconciler.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{PackageManager, Platform, SchedulerBackend};
use crate::model::{ScheduledEntry, ValidJob};
use crate::render::render_config;
use crate::utils::errors::ReconciliationError;
use crate::{AgentError, Result};

#[derive(Default)]
pub struct MemoryPackages {
    pub version: Mutex<Option<String>>,
    pub broken: bool,
}

#[async_trait]
impl PackageManager for MemoryPackages {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn installed_version(&self) -> std::result::Result<Option<String>, ReconciliationError> {
        if self.broken {
            return Err(ReconciliationError::ToolVersion("broken".to_string()));
        }
        Ok(self.version.lock().unwrap().clone())
    }

    async fn install(&self) -> Result<()> {
        *self.version.lock().unwrap() = Some("0.17.3".to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryScheduler {
    pub entries: Mutex<BTreeMap<String, ScheduledEntry>>,
    /// Jobs whose schedule actions fail
    pub failing: BTreeSet<String>,
}

impl MemoryScheduler {
    pub fn with_entries(entries: BTreeMap<String, ScheduledEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            failing: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl SchedulerBackend for MemoryScheduler {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self) -> std::result::Result<BTreeMap<String, ScheduledEntry>, ReconciliationError> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn write_config(&self, job: &ValidJob) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(job.name.clone()).or_insert(ScheduledEntry {
            schedule: String::new(),
            config: None,
        });
        entry.config = Some(render_config(job));
        Ok(())
    }

    async fn schedule(&self, job: &ValidJob) -> Result<()> {
        if self.failing.contains(&job.name) {
            return Err(AgentError::Platform(format!("cannot schedule {}", job.name)));
        }
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(job.name.clone()).or_insert(ScheduledEntry {
            schedule: String::new(),
            config: None,
        });
        entry.schedule = job.schedule.expression().to_string();
        Ok(())
    }

    async fn unschedule(&self, name: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(name);
        Ok(())
    }
}

pub fn platform(packages: Arc<MemoryPackages>, scheduler: Arc<MemoryScheduler>) -> Platform {
    Platform::new(packages, scheduler)
}
