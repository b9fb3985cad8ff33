//! Desired-state and observed-state types.

pub mod host;
pub mod job;
pub mod plan;
pub mod run;
pub mod schedule;

pub use host::{HostState, Reachability, ScheduledEntry};
pub use job::{
    load_jobs, parse_jobs, BackupJob, CredentialsRef, RepositoryUri, RetentionPolicy,
    RetentionSpec, Scheme, ValidJob,
};
pub use plan::{Action, ReconciliationPlan};
pub use run::{RunResult, RunStatus, Trigger};
pub use schedule::Schedule;
