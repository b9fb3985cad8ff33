//! cron.d backend: one `restic-<job>` file per job.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::files::{read_dir_optional, read_optional, remove_optional, write_atomic};
use super::{header, is_managed, run_command_line, ConfigStore, SchedulerBackend};
use crate::model::{ScheduledEntry, ValidJob};
use crate::render::MANAGED_HEADER;
use crate::utils::errors::ReconciliationError;
use crate::Result;

const FILE_PREFIX: &str = "restic-";

pub struct CronD {
    cron_dir: PathBuf,
    configs: ConfigStore,
    command: Vec<String>,
    user: String,
}

impl CronD {
    pub fn new(cron_dir: PathBuf, configs: ConfigStore, command: Vec<String>, user: String) -> Self {
        Self {
            cron_dir,
            configs,
            command,
            user,
        }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.cron_dir.join(format!("{}{}", FILE_PREFIX, file_name(name)))
    }

    fn render_entry(&self, job: &ValidJob) -> String {
        format!(
            "{header}\n# job: {name}\n# schedule: {schedule}\n\
             SHELL=/bin/sh\n\
             PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n\
             {schedule} {user} {command}\n",
            header = MANAGED_HEADER,
            name = job.name,
            schedule = job.schedule.expression(),
            user = self.user,
            command = run_command_line(&self.command, &job.name),
        )
    }
}

/// cron skips file names containing dots. `_` is doubled and `.` becomes `_d`,
/// so distinct job names never share a file.
pub fn file_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '_' => encoded.push_str("__"),
            '.' => encoded.push_str("_d"),
            c => encoded.push(c),
        }
    }
    encoded
}

#[async_trait]
impl SchedulerBackend for CronD {
    fn name(&self) -> &'static str {
        "cron"
    }

    async fn list(&self) -> std::result::Result<BTreeMap<String, ScheduledEntry>, ReconciliationError> {
        let err = |e: std::io::Error| ReconciliationError::ScheduledEntries(e.to_string());
        let mut entries = BTreeMap::new();

        if let Some(mut dir) = read_dir_optional(&self.cron_dir).await.map_err(err)? {
            while let Some(entry) = dir.next_entry().await.map_err(err)? {
                if !entry.file_name().to_string_lossy().starts_with(FILE_PREFIX) {
                    continue;
                }
                let Some(content) = read_optional(&entry.path()).await.map_err(err)? else {
                    continue;
                };
                if !is_managed(&content) {
                    continue;
                }
                if let Some(name) = header(&content, "job") {
                    let schedule = header(&content, "schedule").unwrap_or_default().to_string();
                    let config = self.configs.read(name).await.map_err(err)?;
                    entries.insert(name.to_string(), ScheduledEntry { schedule, config });
                }
            }
        }

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
        write_atomic(&self.entry_path(&job.name), &self.render_entry(job)).await?;
        Ok(())
    }

    async fn unschedule(&self, name: &str) -> Result<()> {
        remove_optional(&self.entry_path(name)).await?;
        self.configs.remove(name).await?;
        Ok(())
    }
}
