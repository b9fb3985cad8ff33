//! Desired-state reconciliation.
//!
//! A pass validates the declared jobs, takes a fresh [`HostState`] snapshot,
//! diffs the two into a [`ReconciliationPlan`] and applies it. Planning is a
//! pure function, so running a pass twice against an unchanged host yields an
//! empty second plan.

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::model::{Action, BackupJob, HostState, ReconciliationPlan, ValidJob};
use crate::platform::Platform;
use crate::render::render_config;
use crate::utils::errors::{ReconciliationError, ValidationError};
use crate::validate::validate;

/// Compute the actions that move `observed` towards `desired`.
///
/// # Arguments
/// * `desired` - Validated jobs keyed by name
/// * `observed` - Host snapshot taken at the start of the pass
///
/// # Returns
/// Actions ordered install, write-config, schedule/reschedule, unschedule, and
/// by job name within each group.
pub fn reconcile(desired: &BTreeMap<String, ValidJob>, observed: &HostState) -> ReconciliationPlan {
    let mut actions = Vec::new();

    if !desired.is_empty() && !observed.is_installed() {
        actions.push(Action::Install);
    }

    for (name, job) in desired {
        match observed.scheduled.get(name) {
            None => actions.push(Action::Schedule(job.clone())),
            Some(entry) => {
                let config = render_config(job);
                if entry.schedule != job.schedule.expression()
                    || entry.config.as_deref() != Some(config.as_str())
                {
                    actions.push(Action::WriteConfig(job.clone()));
                    actions.push(Action::Reschedule(job.clone()));
                }
            }
        }
    }

    for name in observed.scheduled.keys() {
        if !desired.contains_key(name) {
            actions.push(Action::Unschedule(name.clone()));
        }
    }

    actions.sort_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then_with(|| a.job_name().cmp(&b.job_name()))
    });

    ReconciliationPlan { actions }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub action: String,
    pub error: String,
}

/// Outcome of applying one plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub failed: Vec<ActionFailure>,
    /// Actions not attempted because an earlier action for the same job failed
    pub skipped: Vec<String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Execute a plan in order. A failed action is recorded against its job; the
/// job's remaining actions are skipped and every other job proceeds.
pub async fn apply_plan(plan: &ReconciliationPlan, platform: &Platform) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut broken: Vec<&str> = Vec::new();

    for action in plan.iter() {
        if action.job_name().is_some_and(|name| broken.contains(&name)) {
            report.skipped.push(action.to_string());
            continue;
        }

        match platform.apply(action).await {
            Ok(()) => report.applied.push(action.to_string()),
            Err(e) => {
                warn!(action = %action, error = %e, "Action failed");
                if let Some(name) = action.job_name() {
                    broken.push(name);
                }
                report.failed.push(ActionFailure {
                    action: action.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {
    /// Plan without applying
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub desired: BTreeMap<String, ValidJob>,
    pub invalid: Vec<(String, ValidationError)>,
    pub unreachable: Vec<String>,
    pub plan: ReconciliationPlan,
    /// `None` for dry runs
    pub applied: Option<ApplyReport>,
}

/// Validate every declared job, keeping the valid ones by name.
pub fn validate_all(jobs: &[BackupJob]) -> (BTreeMap<String, ValidJob>, Vec<(String, ValidationError)>) {
    let mut desired = BTreeMap::new();
    let mut invalid = Vec::new();
    for job in jobs {
        match validate(job) {
            Ok(valid) => {
                desired.insert(valid.name.clone(), valid);
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "Rejected job");
                invalid.push((job.name.clone(), e));
            }
        }
    }
    (desired, invalid)
}

/// One full reconciliation pass. Only failing to observe the host aborts it.
pub async fn run_pass(
    desired_raw: &[BackupJob],
    platform: &Platform,
    options: PassOptions,
) -> Result<PassReport, ReconciliationError> {
    let (desired, invalid) = validate_all(desired_raw);

    let mut observed = platform.observe(&desired).await?;
    // a job that fails validation keeps whatever is already scheduled for it
    for (name, _) in &invalid {
        observed.scheduled.remove(name);
    }

    let unreachable: Vec<String> = observed
        .unreachable_repositories()
        .map(str::to_string)
        .collect();
    for uri in &unreachable {
        warn!(repository = %uri, "Repository unreachable");
    }

    let plan = reconcile(&desired, &observed);
    info!(
        jobs = desired.len(),
        invalid = invalid.len(),
        actions = plan.len(),
        dry_run = options.dry_run,
        "Reconciliation planned"
    );

    let applied = if options.dry_run || plan.is_empty() {
        None
    } else {
        Some(apply_plan(&plan, platform).await)
    };

    Ok(PassReport {
        desired,
        invalid,
        unreachable,
        plan,
        applied,
    })
}
