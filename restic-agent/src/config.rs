//! Configuration management for the restic agent.
//!
//! Loads configuration from a TOML file with `RESTIC_AGENT__SECTION__KEY`
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub restic: ResticConfig,
    pub platform: PlatformConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identifier, used in log lines and run history
    pub id: String,

    /// Working directory for run history
    pub data_dir: PathBuf,

    /// Desired-state file with one `[jobs.<name>]` table per backup job
    pub jobs_file: PathBuf,

    /// Seconds between reconciliation passes in daemon mode
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResticConfig {
    /// restic executable
    pub binary: PathBuf,

    /// Wrapper prepended to every invocation, e.g. `["nice", "-n", "10"]`
    pub command_prefix: Vec<String>,

    /// Probe every repository with `restic cat config` while gathering host facts
    pub probe_repositories: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// apt, dnf, yum, zypper, pacman, apk or none
    pub package_manager: String,

    /// agent, systemd or cron
    pub scheduler: String,

    /// Where rendered `<job>.env` files are written
    pub config_dir: PathBuf,

    /// systemd unit directory
    pub unit_dir: PathBuf,

    /// Run `systemctl` after writing units
    pub manage_units: bool,

    /// cron.d directory
    pub cron_dir: PathBuf,

    /// User column for cron.d entries
    pub cron_user: String,

    /// Path of this binary, referenced from timer and cron entries
    pub agent_binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of different jobs running at once
    pub max_concurrent_jobs: usize,

    /// Attempts per fire, including the first one
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub backoff_multiplier: f64,

    /// Add up to 25% random jitter to each backoff delay
    pub jitter: bool,

    /// Seconds a cancelled restic process gets between SIGTERM and SIGKILL
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// full or compact
    pub format: String,

    /// Include the module target in each line
    pub target: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "restic-agent-01".to_string()),
            data_dir: PathBuf::from("/var/lib/restic-agent"),
            jobs_file: PathBuf::from("/etc/restic-agent/jobs.toml"),
            reconcile_interval_secs: 300,
        }
    }
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("restic"),
            command_prefix: Vec::new(),
            probe_repositories: false,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            package_manager: "apt".to_string(),
            scheduler: "agent".to_string(),
            config_dir: PathBuf::from("/etc/restic-agent/jobs.d"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            manage_units: true,
            cron_dir: PathBuf::from("/etc/cron.d"),
            cron_user: "root".to_string(),
            agent_binary: PathBuf::from("/usr/local/bin/restic-agent"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            max_attempts: 3,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 600_000,
            backoff_multiplier: 2.0,
            jitter: true,
            grace_period_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            target: true,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("RESTIC_AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> crate::Result<()> {
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(crate::AgentError::Config(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.scheduler.backoff_multiplier < 1.0 {
            return Err(crate::AgentError::Config(
                "scheduler.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn history_file(&self) -> PathBuf {
        self.agent.data_dir.join("runs.jsonl")
    }

    /// Per-job run locks shared by the daemon and `restic-agent run`
    pub fn lock_dir(&self) -> PathBuf {
        self.agent.data_dir.join("locks")
    }
}
