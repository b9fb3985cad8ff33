//! Error types for the restic agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Jobs file error: {0}")]
    JobsFile(#[from] toml::de::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for AgentError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        AgentError::Scheduler(e.to_string())
    }
}

/// A declared job was rejected. Only the offending job is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Host facts could not be gathered; the whole pass is abandoned.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("failed to read scheduled entries: {0}")]
    ScheduledEntries(String),

    #[error("failed to probe installed restic version: {0}")]
    ToolVersion(String),
}

/// A single restic invocation failed.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("restic exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),
}

/// restic exit code for "repository does not exist".
pub const EXIT_REPOSITORY_MISSING: i32 = 10;
/// restic exit code for "wrong password".
pub const EXIT_WRONG_PASSWORD: i32 = 12;

impl ExecutionError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Spawn { source, .. } => {
                source.kind() != std::io::ErrorKind::NotFound
                    && source.kind() != std::io::ErrorKind::PermissionDenied
            }
            ExecutionError::Exit { code, .. } => !matches!(
                code,
                Some(EXIT_REPOSITORY_MISSING) | Some(EXIT_WRONG_PASSWORD)
            ),
            ExecutionError::Credentials(_) => false,
            ExecutionError::Cancelled(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled(_))
    }
}

/// A run was interrupted by shutdown or an explicit cancel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct CancellationError {
    pub reason: String,
}

impl CancellationError {
    pub fn cancelled() -> Self {
        Self {
            reason: "cancelled".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
