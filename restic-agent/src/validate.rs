//! Rejects malformed job declarations before they reach the reconciler.
//!
//! Checks are syntactic only; nothing here touches the filesystem or network.
//! The first violation wins.

use std::path::PathBuf;

use crate::model::{
    BackupJob, CredentialsRef, RepositoryUri, RetentionPolicy, RetentionSpec, Schedule, ValidJob,
};
use crate::utils::errors::ValidationError;

pub fn validate(job: &BackupJob) -> Result<ValidJob, ValidationError> {
    validate_name(&job.name)?;
    let paths = validate_paths(&job.paths)?;
    let repository = RepositoryUri::parse(&job.repository)
        .map_err(|reason| ValidationError::new("repository", reason))?;
    let schedule = validate_schedule(&job.schedule)?;
    let retention = validate_retention(&job.retention)?;
    let credentials = job
        .credentials
        .as_deref()
        .map(CredentialsRef::parse)
        .transpose()
        .map_err(|reason| ValidationError::new("credentials", reason))?;

    Ok(ValidJob {
        name: job.name.clone(),
        paths,
        repository,
        schedule,
        retention,
        credentials,
        exclude: job.exclude.clone(),
        tags: job.tags.clone(),
        host: job.host.clone(),
    })
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "empty"));
    }
    if name.starts_with('.') {
        return Err(ValidationError::new("name", "must not start with '.'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ValidationError::new(
            "name",
            format!("invalid character {:?}", c),
        ));
    }
    Ok(())
}

fn validate_paths(paths: &[String]) -> Result<Vec<PathBuf>, ValidationError> {
    if paths.is_empty() {
        return Err(ValidationError::new("paths", "empty"));
    }
    paths
        .iter()
        .map(|path| {
            if path.is_empty() {
                Err(ValidationError::new("paths", "empty path"))
            } else if path.contains('\0') {
                Err(ValidationError::new("paths", format!("NUL byte in {:?}", path)))
            } else if !path.starts_with('/') {
                Err(ValidationError::new("paths", format!("not absolute: {}", path)))
            } else {
                Ok(PathBuf::from(path))
            }
        })
        .collect()
}

fn validate_schedule(expression: &str) -> Result<Schedule, ValidationError> {
    let schedule =
        Schedule::parse(expression).map_err(|reason| ValidationError::new("schedule", reason))?;
    if schedule.upcoming().is_none() {
        return Err(ValidationError::new("schedule", "never fires"));
    }
    Ok(schedule)
}

fn validate_retention(spec: &RetentionSpec) -> Result<RetentionPolicy, ValidationError> {
    let count = |value: Option<i64>| -> Result<Option<u32>, ValidationError> {
        match value {
            None => Ok(None),
            Some(n) if n < 0 => Err(ValidationError::new("retention", "negative")),
            Some(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| ValidationError::new("retention", "too large")),
        }
    };

    Ok(RetentionPolicy {
        keep_last: count(spec.keep_last)?,
        keep_hourly: count(spec.keep_hourly)?,
        keep_daily: count(spec.keep_daily)?,
        keep_weekly: count(spec.keep_weekly)?,
        keep_monthly: count(spec.keep_monthly)?,
        keep_yearly: count(spec.keep_yearly)?,
        prune: spec.prune.unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scheme;

    fn daily() -> BackupJob {
        BackupJob {
            name: "daily".to_string(),
            paths: vec!["/var/backups".to_string()],
            repository: "s3:s3.amazonaws.com/bucket_backups".to_string(),
            schedule: "0 2 * * *".to_string(),
            ..BackupJob::default()
        }
    }

    #[test]
    fn test_valid_job() {
        let job = validate(&daily()).unwrap();
        assert_eq!(job.name, "daily");
        assert_eq!(job.paths, vec![PathBuf::from("/var/backups")]);
        assert_eq!(job.repository.scheme, Scheme::S3);
        assert_eq!(job.schedule.expression(), "0 2 * * *");
        assert!(job.retention.is_empty());
        assert!(job.retention.prune);
        assert!(job.credentials.is_none());
    }

    #[test]
    fn test_negative_retention() {
        let mut job = daily();
        job.retention.keep_daily = Some(-1);
        assert_eq!(
            validate(&job).unwrap_err(),
            ValidationError {
                field: "retention",
                reason: "negative".to_string()
            }
        );
    }

    #[test]
    fn test_zero_retention_is_allowed() {
        let mut job = daily();
        job.retention.keep_last = Some(0);
        assert_eq!(validate(&job).unwrap().retention.keep_last, Some(0));
    }

    #[test]
    fn test_empty_paths() {
        let mut job = daily();
        job.paths.clear();
        assert_eq!(validate(&job).unwrap_err().field, "paths");

        job.paths = vec!["relative/dir".to_string()];
        assert_eq!(validate(&job).unwrap_err().field, "paths");
    }

    #[test]
    fn test_unsupported_scheme() {
        let mut job = daily();
        job.repository = "azure:container:/".to_string();
        let err = validate(&job).unwrap_err();
        assert_eq!(err.field, "repository");
        assert_eq!(err.reason, "unsupported scheme \"azure\"");
    }

    #[test]
    fn test_bad_schedule() {
        let mut job = daily();
        job.schedule = "daily at two".to_string();
        assert_eq!(validate(&job).unwrap_err().field, "schedule");

        job.schedule = "0 0 30 2 *".to_string();
        let err = validate(&job).unwrap_err();
        assert_eq!(err.field, "schedule");
        assert_eq!(err.reason, "never fires");
    }

    #[test]
    fn test_bad_name() {
        let mut job = daily();
        job.name = "../etc".to_string();
        assert_eq!(validate(&job).unwrap_err().field, "name");

        job.name = "nightly db".to_string();
        assert_eq!(validate(&job).unwrap_err().field, "name");
    }

    #[test]
    fn test_first_violation_wins() {
        let mut job = daily();
        job.paths.clear();
        job.retention.keep_last = Some(-3);
        assert_eq!(validate(&job).unwrap_err().field, "paths");
    }

    #[test]
    fn test_plaintext_credentials_rejected() {
        let mut job = daily();
        job.credentials = Some("correct horse battery staple".to_string());
        assert_eq!(validate(&job).unwrap_err().field, "credentials");

        job.credentials = Some("env:RESTIC_PASSWORD_DAILY".to_string());
        assert!(validate(&job).is_ok());
    }
}
