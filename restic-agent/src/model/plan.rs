//! Reconciliation plans.

use std::fmt;

use super::job::ValidJob;

/// One step towards the desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Install restic through the package manager
    Install,
    /// Rewrite the job's configuration file
    WriteConfig(ValidJob),
    /// Write the job's configuration and create its schedule entry
    Schedule(ValidJob),
    /// Replace an existing schedule entry
    Reschedule(ValidJob),
    /// Remove a schedule entry and its configuration
    Unschedule(String),
}

impl Action {
    /// Position of the action's group in a plan.
    pub fn rank(&self) -> u8 {
        match self {
            Action::Install => 0,
            Action::WriteConfig(_) => 1,
            Action::Schedule(_) | Action::Reschedule(_) => 2,
            Action::Unschedule(_) => 3,
        }
    }

    pub fn job_name(&self) -> Option<&str> {
        match self {
            Action::Install => None,
            Action::WriteConfig(job) | Action::Schedule(job) | Action::Reschedule(job) => {
                Some(&job.name)
            }
            Action::Unschedule(name) => Some(name),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::WriteConfig(_) => "write-config",
            Action::Schedule(_) => "schedule",
            Action::Reschedule(_) => "reschedule",
            Action::Unschedule(_) => "unschedule",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_name() {
            Some(name) => write!(f, "{}({})", self.kind(), name),
            None => f.write_str(self.kind()),
        }
    }
}

/// Ordered actions produced by one pass; discarded once applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub actions: Vec<Action>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// Plan entries rendered as `kind(name)`, in order.
    pub fn summary(&self) -> Vec<String> {
        self.actions.iter().map(ToString::to_string).collect()
    }
}

impl IntoIterator for ReconciliationPlan {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.into_iter()
    }
}
