use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RetryPending,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RetryPending => "retry_pending",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retry_pending" => Some(JobStatus::RetryPending),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record of the most recent failure on a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub message: String,
    /// "retryable" | "permanent" | "timeout" | "cancelled"
    pub kind: String,
    pub attempt: i32,
    pub at: DateTime<Utc>,
}

/// The job record as every backend reports it. Attempts are normalized to
/// claims-so-far on all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
}

/// Lookup handle for client operations: either the backend-assigned id or
/// the caller's idempotency key scoped to its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobRef {
    Id(String),
    Key { queue: String, key: String },
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRef::Id(id) => write!(f, "id:{}", id),
            JobRef::Key { queue, key } => write!(f, "key:{}/{}", queue, key),
        }
    }
}

/// What to do when an enqueue collides on (queue, idempotency key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Insert-or-ignore; a collision returns the existing job id.
    #[default]
    Never,
    /// Replace the existing job unless it is currently processing, which is
    /// an `AlreadyActive` error.
    IfNotActive,
}

/// Options accepted by `Client::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub backoff: Option<RetryPolicy>,
    pub stages: Vec<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub replace: ReplaceMode,
}

impl EnqueueOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn backoff(mut self, policy: RetryPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    #[must_use]
    pub fn stages<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.stages = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn replace(mut self, mode: ReplaceMode) -> Self {
        self.replace = mode;
        self
    }

    /// The effective first-eligible time, if the job is deferred at all.
    pub fn scheduled_for(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.run_at, self.delay) {
            (Some(at), _) => Some(at),
            (None, Some(d)) => Some(now + chrono::Duration::milliseconds(d.as_millis() as i64)),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::RetryPending,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn scheduled_for_prefers_run_at() {
        let now = Utc::now();
        let at = now + chrono::Duration::hours(1);
        let opts = EnqueueOptions::new()
            .run_at(at)
            .delay(Duration::from_secs(5));
        assert_eq!(opts.scheduled_for(now), Some(at));

        let opts = EnqueueOptions::new().delay(Duration::from_millis(250));
        let scheduled = opts.scheduled_for(now).unwrap();
        assert_eq!(scheduled - now, chrono::Duration::milliseconds(250));

        assert_eq!(EnqueueOptions::new().scheduled_for(now), None);
    }

    #[test]
    fn job_ref_display() {
        assert_eq!(JobRef::Id("abc".into()).to_string(), "id:abc");
        assert_eq!(
            JobRef::Key {
                queue: "email".into(),
                key: "k1".into()
            }
            .to_string(),
            "key:email/k1"
        );
    }
}
