//! Backup job declarations and their validated form.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::schedule::Schedule;

/// A backup job as declared in the jobs file, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Job name (injected from the table key)
    #[serde(skip)]
    pub name: String,

    /// Source paths; a single string is accepted as a one-element list
    #[serde(alias = "files", deserialize_with = "one_or_many")]
    pub paths: Vec<String>,

    /// restic repository, e.g. `s3:s3.amazonaws.com/bucket` or `/srv/restic`
    #[serde(alias = "repo")]
    pub repository: String,

    /// Five-field cron expression or `@daily`-style macro
    pub schedule: String,

    #[serde(default)]
    pub retention: RetentionSpec,

    /// Credentials handle: `file:<path>`, `command:<cmd>` or `env:<VAR>`
    #[serde(default)]
    pub credentials: Option<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides the hostname restic records in snapshots
    #[serde(default)]
    pub host: Option<String>,
}

/// Declared retention counts. Signed so that bad input reaches the validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionSpec {
    pub keep_last: Option<i64>,
    pub keep_hourly: Option<i64>,
    pub keep_daily: Option<i64>,
    pub keep_weekly: Option<i64>,
    pub keep_monthly: Option<i64>,
    pub keep_yearly: Option<i64>,
    pub prune: Option<bool>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: BTreeMap<String, BackupJob>,
}

/// Parse a jobs document. Table keys become job names, so names are unique.
pub fn parse_jobs(content: &str) -> crate::Result<Vec<BackupJob>> {
    let file: JobsFile = toml::from_str(content)?;
    Ok(file
        .jobs
        .into_iter()
        .map(|(name, mut job)| {
            job.name = name;
            job
        })
        .collect())
}

/// Load the jobs file. A missing file means no jobs are desired.
pub fn load_jobs(path: &Path) -> crate::Result<Vec<BackupJob>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_jobs(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Jobs file not found, treating as empty");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Repository schemes restic is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Local,
    S3,
    Sftp,
    Rest,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Scheme::Local),
            "s3" => Some(Scheme::S3),
            "sftp" => Some(Scheme::Sftp),
            "rest" => Some(Scheme::Rest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::S3 => "s3",
            Scheme::Sftp => "sftp",
            Scheme::Rest => "rest",
        }
    }
}

/// A repository location with a recognized scheme. `raw` is passed to restic verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryUri {
    pub scheme: Scheme,
    pub location: String,
    raw: String,
}

impl RepositoryUri {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty".to_string());
        }
        if raw.starts_with('/') {
            return Ok(Self {
                scheme: Scheme::Local,
                location: raw.to_string(),
                raw: raw.to_string(),
            });
        }

        let (scheme, location) = raw
            .split_once(':')
            .ok_or_else(|| "missing scheme".to_string())?;
        let scheme = Scheme::parse(scheme)
            .ok_or_else(|| format!("unsupported scheme \"{}\"", scheme))?;
        if location.is_empty() {
            return Err("empty location".to_string());
        }

        Ok(Self {
            scheme,
            location: location.to_string(),
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RepositoryUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validated retention counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub prune: bool,
}

impl RetentionPolicy {
    /// `(flag, count)` pairs in the order restic documents them.
    pub fn counts(&self) -> [(&'static str, Option<u32>); 6] {
        [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ]
    }

    /// No count declared: `restic forget` is skipped.
    pub fn is_empty(&self) -> bool {
        self.counts().iter().all(|(_, count)| count.is_none())
    }
}

/// Where restic gets the repository password from. Never the password itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsRef {
    File(PathBuf),
    Command(String),
    Env(String),
}

impl CredentialsRef {
    pub fn parse(handle: &str) -> Result<Self, String> {
        let (kind, value) = handle
            .split_once(':')
            .ok_or_else(|| "expected file:, command: or env: handle".to_string())?;
        if value.trim().is_empty() {
            return Err(format!("empty {} handle", kind));
        }
        match kind {
            "file" => Ok(CredentialsRef::File(PathBuf::from(value))),
            "command" => Ok(CredentialsRef::Command(value.to_string())),
            "env" => Ok(CredentialsRef::Env(value.to_string())),
            other => Err(format!("unknown handle kind \"{}\"", other)),
        }
    }
}

impl fmt::Display for CredentialsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsRef::File(path) => write!(f, "file:{}", path.display()),
            CredentialsRef::Command(cmd) => write!(f, "command:{}", cmd),
            CredentialsRef::Env(var) => write!(f, "env:{}", var),
        }
    }
}

/// A job that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidJob {
    pub name: String,
    pub paths: Vec<PathBuf>,
    pub repository: RepositoryUri,
    pub schedule: Schedule,
    pub retention: RetentionPolicy,
    pub credentials: Option<CredentialsRef>,
    pub exclude: Vec<String>,
    pub tags: Vec<String>,
    pub host: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jobs_injects_names() -> crate::Result<()> {
        let jobs = parse_jobs(
            r#"
[jobs.daily]
files = "/var/backups"
repo = "s3:s3.amazonaws.com/bucket_backups"
schedule = "0 2 * * *"

[jobs.etc]
paths = ["/etc", "/root"]
repository = "/srv/restic"
schedule = "@hourly"
credentials = "file:/etc/restic/password"

[jobs.etc.retention]
keep_daily = 7
prune = false
"#,
        )?;

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "daily");
        assert_eq!(jobs[0].paths, vec!["/var/backups".to_string()]);
        assert_eq!(jobs[1].name, "etc");
        assert_eq!(jobs[1].paths.len(), 2);
        assert_eq!(jobs[1].retention.keep_daily, Some(7));
        assert_eq!(jobs[1].retention.prune, Some(false));
        Ok(())
    }

    #[test]
    fn test_empty_document_has_no_jobs() -> crate::Result<()> {
        assert!(parse_jobs("")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_jobs_file_is_empty() -> crate::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        assert!(load_jobs(&temp_dir.path().join("absent.toml"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_repository_uri() {
        let s3 = RepositoryUri::parse("s3:s3.amazonaws.com/bucket_backups").unwrap();
        assert_eq!(s3.scheme, Scheme::S3);
        assert_eq!(s3.location, "s3.amazonaws.com/bucket_backups");
        assert_eq!(s3.to_string(), "s3:s3.amazonaws.com/bucket_backups");

        let sftp = RepositoryUri::parse("sftp:backup@host:/srv/restic").unwrap();
        assert_eq!(sftp.scheme, Scheme::Sftp);
        assert_eq!(sftp.location, "backup@host:/srv/restic");

        let local = RepositoryUri::parse("/srv/restic").unwrap();
        assert_eq!(local.scheme, Scheme::Local);

        assert_eq!(
            RepositoryUri::parse("b2:bucket").unwrap_err(),
            "unsupported scheme \"b2\""
        );
        assert_eq!(RepositoryUri::parse("rest:").unwrap_err(), "empty location");
        assert_eq!(RepositoryUri::parse("bucket").unwrap_err(), "missing scheme");
    }

    #[test]
    fn test_credentials_ref() {
        assert_eq!(
            CredentialsRef::parse("file:/etc/restic/pw").unwrap(),
            CredentialsRef::File(PathBuf::from("/etc/restic/pw"))
        );
        assert_eq!(
            CredentialsRef::parse("env:RESTIC_PW").unwrap().to_string(),
            "env:RESTIC_PW"
        );
        assert!(CredentialsRef::parse("hunter2").is_err());
        assert!(CredentialsRef::parse("vault:secret").is_err());
        assert!(CredentialsRef::parse("file:").is_err());
    }

    #[test]
    fn test_retention_is_empty() {
        let mut retention = RetentionPolicy::default();
        assert!(retention.is_empty());
        retention.keep_weekly = Some(4);
        assert!(!retention.is_empty());
    }
}
