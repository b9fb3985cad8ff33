//! restic subprocess invocation.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{CredentialsRef, ValidJob};
use crate::platform::RepositoryProbe;
use crate::render::{render_args, render_forget_args, render_probe_args};
use crate::utils::errors::{CancellationError, ExecutionError};

/// restic exit code for "snapshot created, but some source files could not be read".
const EXIT_INCOMPLETE: i32 = 3;

/// How much of stderr ends up in a run's error detail.
const STDERR_TAIL: usize = 4096;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// What a successful `restic backup` reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupOutput {
    /// Exit code 3: the snapshot is missing some files
    pub partial: bool,
    pub bytes_added: Option<u64>,
    pub snapshot_id: Option<String>,
    pub stderr: String,
}

/// Runs restic for a job. Implemented by [`ResticRunner`]; tests substitute fakes.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn backup(
        &self,
        job: &ValidJob,
        cancel: &CancellationToken,
    ) -> Result<BackupOutput, ExecutionError>;

    /// Apply the job's retention policy. Only called when the policy is non-empty.
    async fn forget(&self, job: &ValidJob, cancel: &CancellationToken) -> Result<(), ExecutionError>;
}

#[derive(Debug)]
struct ProcessOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct JsonMessage {
    message_type: String,
    #[serde(default)]
    data_added: Option<u64>,
    #[serde(default)]
    snapshot_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResticRunner {
    binary: PathBuf,
    prefix: Vec<String>,
    grace_period: Duration,
}

impl ResticRunner {
    pub fn new(binary: PathBuf, prefix: Vec<String>, grace_period: Duration) -> Self {
        Self {
            binary,
            prefix,
            grace_period,
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(
            config.restic.binary.clone(),
            config.restic.command_prefix.clone(),
            config.scheduler.grace_period(),
        )
    }

    fn command(&self) -> Command {
        match self.prefix.split_first() {
            Some((program, rest)) => {
                let mut cmd = Command::new(program);
                cmd.args(rest).arg(&self.binary);
                cmd
            }
            None => Command::new(&self.binary),
        }
    }

    fn program(&self) -> String {
        self.prefix
            .first()
            .cloned()
            .unwrap_or_else(|| self.binary.display().to_string())
    }

    async fn invoke(
        &self,
        job: &ValidJob,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ExecutionError> {
        let env = credential_env(job.credentials.as_ref())?;

        let mut cmd = self.command();
        cmd.args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(job = %job.name, ?args, "Spawning restic");
        let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            program: self.program(),
            source,
        })?;

        let stdout = child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ExecutionError::Spawn {
                program: self.program(),
                source,
            })?,
            _ = cancel.cancelled() => {
                self.terminate(&job.name, &mut child).await;
                for reader in [stdout, stderr].into_iter().flatten() {
                    reader.abort();
                }
                return Err(CancellationError::cancelled().into());
            }
        };

        let stdout = match stdout {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ProcessOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn terminate(&self, job: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(job, pid, "Sending SIGTERM to restic");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(job, pid, error = %e, "Failed to signal restic");
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(job, grace_secs = self.grace_period.as_secs(), "restic ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(job, error = %e, "Failed to kill restic");
                }
            }
        }
    }
}

#[async_trait]
impl Runner for ResticRunner {
    async fn backup(
        &self,
        job: &ValidJob,
        cancel: &CancellationToken,
    ) -> Result<BackupOutput, ExecutionError> {
        let output = self.invoke(job, render_args(job), cancel).await?;

        match output.code {
            Some(0) | Some(EXIT_INCOMPLETE) => {
                let (bytes_added, snapshot_id) = parse_summary(&output.stdout);
                Ok(BackupOutput {
                    partial: output.code == Some(EXIT_INCOMPLETE),
                    bytes_added,
                    snapshot_id,
                    stderr: tail(&output.stderr, STDERR_TAIL),
                })
            }
            code => Err(ExecutionError::Exit {
                code,
                stderr: tail(&output.stderr, STDERR_TAIL),
            }),
        }
    }

    async fn forget(&self, job: &ValidJob, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let Some(args) = render_forget_args(job) else {
            return Ok(());
        };
        let output = self.invoke(job, args, cancel).await?;
        match output.code {
            Some(0) => Ok(()),
            code => Err(ExecutionError::Exit {
                code,
                stderr: tail(&output.stderr, STDERR_TAIL),
            }),
        }
    }
}

#[async_trait]
impl RepositoryProbe for ResticRunner {
    async fn probe(&self, job: &ValidJob) -> bool {
        let cancel = CancellationToken::new();
        let run = self.invoke(job, render_probe_args(job), &cancel);
        match tokio::time::timeout(PROBE_TIMEOUT, run).await {
            Ok(Ok(output)) => output.code == Some(0),
            Ok(Err(e)) => {
                debug!(job = %job.name, error = %e, "Repository probe failed");
                false
            }
            Err(_) => {
                debug!(job = %job.name, "Repository probe timed out");
                false
            }
        }
    }
}

/// Environment that points restic at the job's password without embedding it.
pub fn credential_env(
    credentials: Option<&CredentialsRef>,
) -> Result<Vec<(String, String)>, ExecutionError> {
    Ok(match credentials {
        None => Vec::new(),
        Some(CredentialsRef::File(path)) => {
            vec![("RESTIC_PASSWORD_FILE".to_string(), path.display().to_string())]
        }
        Some(CredentialsRef::Command(cmd)) => {
            vec![("RESTIC_PASSWORD_COMMAND".to_string(), cmd.clone())]
        }
        Some(CredentialsRef::Env(var)) => {
            let value = std::env::var(var)
                .map_err(|_| ExecutionError::Credentials(format!("${} is not set", var)))?;
            vec![("RESTIC_PASSWORD".to_string(), value)]
        }
    })
}

/// Pull `data_added` and `snapshot_id` out of `restic backup --json` output.
pub fn parse_summary(stdout: &str) -> (Option<u64>, Option<String>) {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<JsonMessage>(line).ok())
        .filter(|msg| msg.message_type == "summary")
        .last()
        .map(|msg| (msg.data_added, msg.snapshot_id))
        .unwrap_or((None, None))
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
