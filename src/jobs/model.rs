//! Job data model: rows, statuses, and enqueue requests.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;

/// Default retry budget for a newly enqueued job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` and a runner to claim it.
    Pending,
    /// Claimed under a lease.
    Running,
    /// Work completed.
    Succeeded,
    /// Retry budget exhausted.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Tenant scope. Opaque to the runner.
    pub workspace_id: String,
    /// Business entity the job acts on. Opaque to the runner.
    pub subject_id: String,
    /// Selects the handler.
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Claims so far. Incremented at claim time.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Lease timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Lease holder (runner invocation id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether another failure would still be retried.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Deserialize the payload into a handler's own type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| HandlerError::InvalidPayload {
            id: self.id,
            reason: e.to_string(),
        })
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub workspace_id: String,
    pub subject_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    /// Defaults to the enqueue time.
    pub run_at: Option<DateTime<Utc>>,
    /// A second enqueue with the same key returns the existing job.
    pub dedupe_key: Option<String>,
}

impl NewJob {
    pub fn new(
        workspace_id: impl Into<String>,
        subject_id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            subject_id: subject_id.into(),
            kind: kind.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
            dedupe_key: None,
        }
    }

    /// Builder: set the retry budget (clamped to at least one attempt).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Builder: schedule for later.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Builder: set a dedupe key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Outcome counts over a time window, used by the failure-rate guardrail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcomeCounts {
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
}

impl JobOutcomeCounts {
    pub fn total(&self) -> u64 {
        self.succeeded + self.retried + self.failed
    }

    /// Share of outcomes that were errors (retried or failed).
    pub fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.retried + self.failed) as f64 / total as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_str_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_defaults() {
        let job = NewJob::new("ws-1", "lead-9", "qualify_lead", serde_json::json!({}));
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.run_at.is_none());
        assert!(job.dedupe_key.is_none());

        let job = job.with_max_attempts(0).with_dedupe_key("lead-9:qualify");
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.dedupe_key.as_deref(), Some("lead-9:qualify"));
    }

    #[test]
    fn payload_as_reports_invalid_payload() {
        #[derive(Debug, Deserialize)]
        struct FollowUp {
            template: String,
        }

        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            workspace_id: "ws".into(),
            subject_id: "lead".into(),
            kind: "send_follow_up".into(),
            payload: serde_json::json!({"template": "day_3"}),
            status: JobStatus::Running,
            attempts: 1,
            max_attempts: 3,
            run_at: now,
            locked_at: None,
            locked_by: None,
            started_at: None,
            finished_at: None,
            last_error: None,
            dedupe_key: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(job.payload_as::<FollowUp>().unwrap().template, "day_3");

        job.payload = serde_json::json!({"tmpl": 3});
        let err = job.payload_as::<FollowUp>().unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload { id, .. } if id == job.id));
        assert!(err.to_string().contains("missing field `template`"));
    }

    #[test]
    fn failure_rate() {
        let empty = JobOutcomeCounts::default();
        assert_eq!(empty.failure_rate(), 0.0);

        let counts = JobOutcomeCounts {
            succeeded: 6,
            retried: 3,
            failed: 1,
        };
        assert_eq!(counts.total(), 10);
        assert!((counts.failure_rate() - 0.4).abs() < 1e-9);
    }
}
