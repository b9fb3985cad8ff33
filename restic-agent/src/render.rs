//! Pure rendering of restic invocations and job configuration files.

use crate::model::{CredentialsRef, ValidJob};

/// Header every rendered file starts with.
pub const MANAGED_HEADER: &str = "# Managed by restic-agent. Local changes will be overwritten.";

/// Arguments for `restic backup`. Credentials never appear here.
pub fn render_args(job: &ValidJob) -> Vec<String> {
    let mut args = repo_args(job);
    args.push("backup".to_string());
    args.push("--json".to_string());

    if let Some(host) = &job.host {
        args.push("--host".to_string());
        args.push(host.clone());
    }
    for tag in &job.tags {
        args.push("--tag".to_string());
        args.push(tag.clone());
    }
    for pattern in &job.exclude {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    args.extend(job.paths.iter().map(|p| p.display().to_string()));
    args
}

/// Arguments for `restic forget`, or `None` when no retention count is set.
pub fn render_forget_args(job: &ValidJob) -> Option<Vec<String>> {
    if job.retention.is_empty() {
        return None;
    }

    let mut args = repo_args(job);
    args.push("forget".to_string());
    for (flag, count) in job.retention.counts() {
        if let Some(count) = count {
            args.push(flag.to_string());
            args.push(count.to_string());
        }
    }
    if let Some(host) = &job.host {
        args.push("--host".to_string());
        args.push(host.clone());
    }
    if !job.tags.is_empty() {
        args.push("--tag".to_string());
        args.push(job.tags.join(","));
    }
    if job.retention.prune {
        args.push("--prune".to_string());
    }
    Some(args)
}

/// Arguments that succeed only when the repository is reachable and initialised.
pub fn render_probe_args(job: &ValidJob) -> Vec<String> {
    let mut args = repo_args(job);
    args.push("cat".to_string());
    args.push("config".to_string());
    args
}

fn repo_args(job: &ValidJob) -> Vec<String> {
    vec!["--repo".to_string(), job.repository.to_string()]
}

/// The job's environment file. Deterministic, so it can be compared byte for byte
/// against what is on disk.
pub fn render_config(job: &ValidJob) -> String {
    let mut out = String::new();
    out.push_str(MANAGED_HEADER);
    out.push('\n');
    out.push_str(&format!("# job: {}\n", job.name));
    push_var(&mut out, "RESTIC_REPOSITORY", job.repository.as_str());

    match &job.credentials {
        Some(CredentialsRef::File(path)) => {
            push_var(&mut out, "RESTIC_PASSWORD_FILE", &path.display().to_string())
        }
        Some(CredentialsRef::Command(cmd)) => push_var(&mut out, "RESTIC_PASSWORD_COMMAND", cmd),
        Some(CredentialsRef::Env(var)) => {
            out.push_str(&format!("# password: ${} in the agent environment\n", var))
        }
        None => out.push_str("# password: restic defaults\n"),
    }

    let paths: Vec<String> = job.paths.iter().map(|p| p.display().to_string()).collect();
    push_var(&mut out, "BACKUP_PATHS", &paths.join(" "));
    push_var(&mut out, "BACKUP_SCHEDULE", job.schedule.expression());
    if !job.exclude.is_empty() {
        push_var(&mut out, "BACKUP_EXCLUDE", &job.exclude.join(" "));
    }
    if !job.tags.is_empty() {
        push_var(&mut out, "BACKUP_TAGS", &job.tags.join(","));
    }
    if let Some(host) = &job.host {
        push_var(&mut out, "BACKUP_HOST", host);
    }
    if let Some(forget) = render_forget_args(job) {
        // drop the leading `--repo <uri> forget`
        push_var(&mut out, "FORGET_ARGS", &forget[3..].join(" "));
    }
    out
}

fn push_var(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(&quote(value));
    out.push('\n');
}

/// Double-quote a value the way systemd `EnvironmentFile=` reads it.
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupJob;
    use crate::validate::validate;

    fn job(retention: &[(&str, i64)]) -> ValidJob {
        let mut raw = BackupJob {
            name: "daily".to_string(),
            paths: vec!["/var/backups".to_string(), "/etc".to_string()],
            repository: "s3:s3.amazonaws.com/bucket_backups".to_string(),
            schedule: "0 2 * * *".to_string(),
            credentials: Some("file:/etc/restic/daily.pw".to_string()),
            ..BackupJob::default()
        };
        for (period, count) in retention {
            match *period {
                "last" => raw.retention.keep_last = Some(*count),
                "daily" => raw.retention.keep_daily = Some(*count),
                "weekly" => raw.retention.keep_weekly = Some(*count),
                _ => unreachable!(),
            }
        }
        validate(&raw).unwrap()
    }

    #[test]
    fn test_render_args() {
        let mut job = job(&[]);
        job.tags = vec!["puppet".to_string()];
        job.exclude = vec!["*.tmp".to_string()];

        assert_eq!(
            render_args(&job),
            vec![
                "--repo",
                "s3:s3.amazonaws.com/bucket_backups",
                "backup",
                "--json",
                "--tag",
                "puppet",
                "--exclude",
                "*.tmp",
                "/var/backups",
                "/etc",
            ]
        );
    }

    #[test]
    fn test_render_args_never_contains_credentials() {
        let job = job(&[]);
        assert!(!render_args(&job).iter().any(|a| a.contains("daily.pw")));
    }

    #[test]
    fn test_forget_args() {
        assert!(render_forget_args(&job(&[])).is_none());

        let args = render_forget_args(&job(&[("weekly", 4), ("daily", 7)])).unwrap();
        assert_eq!(
            args,
            vec![
                "--repo",
                "s3:s3.amazonaws.com/bucket_backups",
                "forget",
                "--keep-daily",
                "7",
                "--keep-weekly",
                "4",
                "--prune",
            ]
        );
    }

    #[test]
    fn test_probe_args() {
        assert_eq!(
            render_probe_args(&job(&[])),
            vec!["--repo", "s3:s3.amazonaws.com/bucket_backups", "cat", "config"]
        );
    }

    #[test]
    fn test_render_config() {
        let config = render_config(&job(&[("last", 10)]));
        let expected = format!(
            "{}\n\
             # job: daily\n\
             RESTIC_REPOSITORY=\"s3:s3.amazonaws.com/bucket_backups\"\n\
             RESTIC_PASSWORD_FILE=\"/etc/restic/daily.pw\"\n\
             BACKUP_PATHS=\"/var/backups /etc\"\n\
             BACKUP_SCHEDULE=\"0 2 * * *\"\n\
             FORGET_ARGS=\"--keep-last 10 --prune\"\n",
            MANAGED_HEADER
        );
        assert_eq!(config, expected);
        assert_eq!(config, render_config(&job(&[("last", 10)])));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a \"b\" $c"), "\"a \\\"b\\\" \\$c\"");
    }
}
