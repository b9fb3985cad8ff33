//! Host capabilities: installing restic and managing scheduled entries.
//!
//! Each capability is a trait with one implementation per platform variant.
//! The variant is picked once at startup from `[platform]` in the config.

pub mod cron;
pub mod files;
#[cfg(test)]
pub mod memory;
pub mod packages;
pub mod systemd;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::executor::ResticRunner;
use crate::model::{Action, HostState, Reachability, ScheduledEntry, ValidJob};
use crate::utils::errors::ReconciliationError;
use crate::{AgentError, Result};

pub use files::ConfigStore;
pub use packages::{PackageKind, SystemPackages};

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Installed restic version, `None` when restic is absent.
    async fn installed_version(&self) -> std::result::Result<Option<String>, ReconciliationError>;

    async fn install(&self) -> Result<()>;
}

#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Entries this backend manages, keyed by job name.
    async fn list(&self) -> std::result::Result<BTreeMap<String, ScheduledEntry>, ReconciliationError>;

    /// Write the job's rendered configuration.
    async fn write_config(&self, job: &ValidJob) -> Result<()>;

    /// Create or replace the job's schedule entry.
    async fn schedule(&self, job: &ValidJob) -> Result<()>;

    /// Remove the job's schedule entry and configuration.
    async fn unschedule(&self, name: &str) -> Result<()>;
}

/// Checks whether a job's repository can be opened.
#[async_trait]
pub trait RepositoryProbe: Send + Sync {
    async fn probe(&self, job: &ValidJob) -> bool;
}

/// The capability set for this host
pub struct Platform {
    packages: Arc<dyn PackageManager>,
    scheduler: Arc<dyn SchedulerBackend>,
    probe: Option<Arc<dyn RepositoryProbe>>,
}

impl Platform {
    pub fn new(packages: Arc<dyn PackageManager>, scheduler: Arc<dyn SchedulerBackend>) -> Self {
        Self {
            packages,
            scheduler,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn RepositoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn describe(&self) -> String {
        format!("{}/{}", self.packages.name(), self.scheduler.name())
    }

    /// Gather a fresh host snapshot. Repositories are probed once per distinct URI.
    pub async fn observe(
        &self,
        desired: &BTreeMap<String, ValidJob>,
    ) -> std::result::Result<HostState, ReconciliationError> {
        let installed_version = self.packages.installed_version().await?;
        let scheduled = self.scheduler.list().await?;

        let mut repositories = BTreeMap::new();
        if let Some(probe) = &self.probe {
            for job in desired.values() {
                let uri = job.repository.to_string();
                if repositories.contains_key(&uri) {
                    continue;
                }
                let reachable = probe.probe(job).await;
                debug!(repository = %uri, reachable, "Probed repository");
                repositories.insert(
                    uri,
                    Reachability {
                        reachable,
                        checked_at: Utc::now(),
                    },
                );
            }
        }

        Ok(HostState {
            installed_version,
            scheduled,
            repositories,
        })
    }

    /// Carry out one plan action
    pub async fn apply(&self, action: &Action) -> Result<()> {
        info!(action = %action, "Applying");
        match action {
            Action::Install => self.packages.install().await,
            Action::WriteConfig(job) => self.scheduler.write_config(job).await,
            Action::Schedule(job) => {
                self.scheduler.write_config(job).await?;
                self.scheduler.schedule(job).await
            }
            Action::Reschedule(job) => self.scheduler.schedule(job).await,
            Action::Unschedule(name) => self.scheduler.unschedule(name).await,
        }
    }
}

/// Pick the scheduler backend named in configuration.
///
/// `agent` is the in-process scheduler, which only exists in daemon mode and is
/// passed in by the caller.
pub fn select_scheduler(
    config: &Config,
    config_path: Option<&Path>,
    agent: Option<Arc<dyn SchedulerBackend>>,
) -> Result<Arc<dyn SchedulerBackend>> {
    let platform = &config.platform;
    let configs = ConfigStore::new(platform.config_dir.clone());
    let command = agent_command(config, config_path);

    match platform.scheduler.as_str() {
        "agent" => agent.ok_or_else(|| {
            AgentError::Config(
                "the agent scheduler only exists while `restic-agent daemon` runs".to_string(),
            )
        }),
        "systemd" => Ok(Arc::new(systemd::SystemdTimers::new(
            platform.unit_dir.clone(),
            configs,
            command,
            platform.manage_units,
        ))),
        "cron" => Ok(Arc::new(cron::CronD::new(
            platform.cron_dir.clone(),
            configs,
            command,
            platform.cron_user.clone(),
        ))),
        other => Err(AgentError::Config(format!(
            "unknown platform.scheduler \"{}\" (expected agent, systemd or cron)",
            other
        ))),
    }
}

/// Assemble the platform for this host around an already selected scheduler backend.
pub fn build(config: &Config, scheduler: Arc<dyn SchedulerBackend>) -> Result<Platform> {
    let platform = Platform::new(select_packages(config)?, scheduler);
    if config.restic.probe_repositories {
        return Ok(platform.with_probe(Arc::new(ResticRunner::from_config(config))));
    }
    Ok(platform)
}

pub fn select_packages(config: &Config) -> Result<Arc<dyn PackageManager>> {
    let kind = PackageKind::parse(&config.platform.package_manager).ok_or_else(|| {
        AgentError::Config(format!(
            "unknown platform.package_manager \"{}\"",
            config.platform.package_manager
        ))
    })?;
    Ok(Arc::new(SystemPackages::new(kind, config.restic.binary.clone())))
}

/// Command line timer and cron entries use to run a job.
fn agent_command(config: &Config, config_path: Option<&Path>) -> Vec<String> {
    let mut command = vec![config.platform.agent_binary.display().to_string()];
    if let Some(path) = config_path {
        command.push("--config".to_string());
        command.push(path.display().to_string());
    }
    command
}

/// `<agent command> run <job>` as a single line, quoting arguments with spaces.
pub fn run_command_line(command: &[String], name: &str) -> String {
    command
        .iter()
        .map(String::as_str)
        .chain(["run", name])
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                crate::render::quote(arg)
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Value of a `# key: value` header line.
pub fn header<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        line.strip_prefix("# ")
            .and_then(|rest| rest.strip_prefix(key))
            .and_then(|rest| rest.strip_prefix(": "))
            .map(str::trim)
    })
}

/// Whether a file was written by this agent.
pub fn is_managed(content: &str) -> bool {
    content.starts_with(crate::render::MANAGED_HEADER)
}
