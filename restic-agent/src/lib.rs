//! restic agent library
//!
//! Keeps a host's restic backup jobs in line with a declarative jobs file and
//! runs them on schedule.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod model;
pub mod platform;
pub mod reconcile;
pub mod render;
pub mod report;
pub mod scheduler;
pub mod utils;
pub mod validate;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
