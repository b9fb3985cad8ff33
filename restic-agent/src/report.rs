//! Run history: every `RunResult` is appended as one JSON line.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::model::RunResult;
use crate::Result;

#[derive(Debug, Clone)]
pub struct Reporter {
    history: PathBuf,
}

impl Reporter {
    pub fn new(history: PathBuf) -> Self {
        Self { history }
    }

    pub fn history_file(&self) -> &Path {
        &self.history
    }

    /// Append one result to the history file
    pub async fn record(&self, result: &RunResult) -> Result<()> {
        if let Some(parent) = self.history.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(job = %result.job, run_id = %result.run_id, "Recorded run");
        Ok(())
    }

    /// Record results from `results` until the channel closes or `shutdown` fires.
    pub fn spawn(
        self,
        mut results: broadcast::Receiver<RunResult>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    received = results.recv() => received,
                    _ = shutdown.cancelled() => break,
                };
                match result {
                    Ok(result) => {
                        if let Err(e) = self.record(&result).await {
                            error!(job = %result.job, error = %e, "Failed to record run");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reporter lagged, runs missing from history");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // drain what was published before shutdown
            while let Ok(result) = results.try_recv() {
                if let Err(e) = self.record(&result).await {
                    error!(job = %result.job, error = %e, "Failed to record run");
                }
            }
        })
    }
}

/// Most recent `limit` results, oldest first. Unparseable lines are skipped.
pub async fn read_history(path: &Path, limit: usize) -> Result<Vec<RunResult>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut results: Vec<RunResult> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "Skipping malformed history line");
                None
            }
        })
        .collect();

    if results.len() > limit {
        results.drain(..results.len() - limit);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunStatus, Trigger};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn result(job: &str, status: RunStatus) -> RunResult {
        RunResult {
            run_id: Uuid::new_v4(),
            job: job.to_string(),
            status,
            trigger: Trigger::Manual,
            started_at: Utc::now(),
            duration: Duration::from_secs(12),
            attempts: 1,
            bytes_transferred: Some(1024),
            snapshot_id: Some("40dc1520".to_string()),
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let reporter = Reporter::new(temp_dir.path().join("state/runs.jsonl"));

        reporter.record(&result("daily", RunStatus::Success)).await.unwrap();
        reporter.record(&result("etc", RunStatus::Failure)).await.unwrap();
        reporter.record(&result("home", RunStatus::Partial)).await.unwrap();

        let all = read_history(reporter.history_file(), 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let last = read_history(reporter.history_file(), 2).await.unwrap();
        let jobs: Vec<&str> = last.iter().map(|r| r.job.as_str()).collect();
        assert_eq!(jobs, vec!["etc", "home"]);
    }

    #[tokio::test]
    async fn test_missing_history_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let history = read_history(&temp_dir.path().join("runs.jsonl"), 5).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("runs.jsonl");
        let good = serde_json::to_string(&result("daily", RunStatus::Success)).unwrap();
        std::fs::write(&path, format!("{{not json\n{}\n", good)).unwrap();

        assert_eq!(read_history(&path, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_reporter_records_broadcasts() {
        let temp_dir = TempDir::new().unwrap();
        let reporter = Reporter::new(temp_dir.path().join("runs.jsonl"));
        let path = reporter.history_file().to_path_buf();
        let (tx, rx) = broadcast::channel(8);
        let shutdown = CancellationToken::new();

        let handle = reporter.spawn(rx, shutdown.clone());
        tx.send(result("daily", RunStatus::Success)).unwrap();
        tx.send(result("etc", RunStatus::Success)).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(read_history(&path, 10).await.unwrap().len(), 2);
    }
}
