//! Observed host facts.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Read-only snapshot taken at the start of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostState {
    /// `None` when restic is not installed
    pub installed_version: Option<String>,

    /// Scheduled entries by job name
    pub scheduled: BTreeMap<String, ScheduledEntry>,

    /// Reachability by repository URI; empty unless probing is enabled
    pub repositories: BTreeMap<String, Reachability>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEntry {
    /// Schedule expression the entry was written with
    pub schedule: String,

    /// Rendered job configuration currently on disk, if any
    pub config: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub reachable: bool,
    pub checked_at: DateTime<Utc>,
}

impl HostState {
    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    pub fn unreachable_repositories(&self) -> impl Iterator<Item = &str> {
        self.repositories
            .iter()
            .filter(|(_, r)| !r.reachable)
            .map(|(uri, _)| uri.as_str())
    }
}
