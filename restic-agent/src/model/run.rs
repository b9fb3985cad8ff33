//! Outcome of a single backup run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    /// Snapshot written, but some files were unreadable or retention failed
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub job: String,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub attempts: u32,
    pub bytes_transferred: Option<u64>,
    pub snapshot_id: Option<String>,
    pub error_detail: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_result_json_shape() -> serde_json::Result<()> {
        let result = RunResult {
            run_id: Uuid::new_v4(),
            job: "daily".to_string(),
            status: RunStatus::Partial,
            trigger: Trigger::Schedule,
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            attempts: 1,
            bytes_transferred: Some(42),
            snapshot_id: None,
            error_detail: Some("some files unreadable".to_string()),
        };

        let value = serde_json::to_value(&result)?;
        assert_eq!(value["status"], "partial");
        assert_eq!(value["trigger"], "schedule");
        assert_eq!(value["duration_ms"], 1500);

        let back: RunResult = serde_json::from_value(value)?;
        assert_eq!(back.duration, Duration::from_millis(1500));
        Ok(())
    }
}
