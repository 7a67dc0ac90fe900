use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use relay_database::Capabilities;

use crate::backoff::RetryPolicy;
use crate::error::Error;
use crate::job::{JobRecord, JobRef};
use crate::scheduler::ScheduleRecord;

/// Snapshot counts per status. Delayed/scheduled-but-not-ready jobs count as
/// pending. Backends that cannot tell a retry apart from a generic delayed
/// job (Redis) report `retry_pending` as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry_pending: i64,
}

/// A fully resolved enqueue, produced by the client from `EnqueueOptions`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub priority: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub backoff: RetryPolicy,
    pub stages: Vec<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub replace_if_not_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    Inserted,
    /// Idempotency-key collision under replace=never; the existing id is
    /// returned untouched.
    ExistingKept,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub id: String,
    pub disposition: EnqueueDisposition,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// How a handler failure should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// What the backend decided to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Another attempt is scheduled at this time.
    RetryPending { at: DateTime<Utc> },
    Failed,
    /// The caller no longer held the lease; nothing was changed.
    NotOwned,
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub message: String,
    pub kind: FailureKind,
}

/// Persisted at job completion: the final stage list and artifacts.
#[derive(Debug, Clone, Default)]
pub struct CompletionUpdate {
    pub artifacts: Option<serde_json::Value>,
    pub stages: Option<Vec<crate::stage::Stage>>,
    pub current_stage: Option<String>,
    pub overall_progress: Option<u8>,
}

/// Mid-flight progress persistence, written only under the worker's lease.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stages: Option<Vec<crate::stage::Stage>>,
    pub current_stage: Option<String>,
    pub overall_progress: Option<u8>,
    pub artifacts: Option<serde_json::Value>,
}

/// Rows touched by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Expired-processing rows with no attempts left, lazily failed.
    pub expired_failed: u64,
    pub removed_by_age: u64,
    pub removed_by_count: u64,
}

/// The storage contract every driver honors. All job mutations are gated on
/// (id, expected status, expected lock holder); the worker runtime and the
/// client are generic over this trait, chosen once at startup.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueOutcome, Error>;

    /// Claim one eligible job for `worker`, taking a lease of `lease`.
    async fn claim(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, Error>;

    /// Blocking claim for backends with a long-poll primitive. Others fall
    /// back to a single non-blocking claim.
    async fn claim_wait(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
        _timeout: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        self.claim(queue, worker, lease).await
    }

    /// Extend the lease. Returns false when the job is no longer owned by
    /// `worker`.
    async fn heartbeat(&self, id: &str, worker: &str, lease: Duration) -> Result<bool, Error>;

    async fn complete(
        &self,
        id: &str,
        worker: &str,
        update: CompletionUpdate,
    ) -> Result<bool, Error>;

    async fn fail(
        &self,
        id: &str,
        worker: &str,
        report: FailureReport,
    ) -> Result<FailDisposition, Error>;

    /// Rate-limit release: back to pending at now+delay without consuming
    /// the attempt. Returns false when not owned.
    async fn reschedule(&self, id: &str, worker: &str, delay: Duration) -> Result<bool, Error>;

    async fn update_progress(
        &self,
        id: &str,
        worker: &str,
        update: ProgressUpdate,
    ) -> Result<bool, Error>;

    async fn cancel(&self, job: &JobRef) -> Result<bool, Error>;

    async fn retry(&self, job: &JobRef) -> Result<bool, Error>;

    async fn get_job(&self, job: &JobRef) -> Result<Option<JobRecord>, Error>;

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, Error>;

    /// Prune terminal rows per the retention policy. Backends that retain
    /// inline (Redis trims and TTLs at the terminal transition) keep the
    /// default no-op.
    async fn run_retention(&self) -> Result<RetentionReport, Error> {
        Ok(RetentionReport::default())
    }
}

/// Storage for recurring-job definitions. The scheduler loop is generic
/// over this; firing races are resolved by the optimistic `advance` guard.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    async fn upsert_schedule(&self, record: &ScheduleRecord) -> Result<(), Error>;

    async fn remove_schedule(&self, key: &str) -> Result<bool, Error>;

    async fn get_schedule(&self, key: &str) -> Result<Option<ScheduleRecord>, Error>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, Error>;

    /// Enabled schedules whose next_run_at is due.
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduleRecord>, Error>;

    /// Advance a schedule past a firing, guarded on the next_run_at the
    /// caller observed. Returns false when another scheduler won the race.
    async fn advance_schedule(
        &self,
        key: &str,
        seen_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<bool, Error>;

    /// Earliest next_run_at across enabled schedules, for the loop's sleep.
    async fn next_schedule_wake(&self) -> Result<Option<DateTime<Utc>>, Error>;
}

/// Placeholder store for transports that do not carry schedules (the HTTP
/// remote worker plane). Every operation reports Unsupported.
pub struct UnsupportedScheduleStore;

#[async_trait]
impl ScheduleStore for UnsupportedScheduleStore {
    async fn upsert_schedule(&self, _record: &ScheduleRecord) -> Result<(), Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn remove_schedule(&self, _key: &str) -> Result<bool, Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn get_schedule(&self, _key: &str) -> Result<Option<ScheduleRecord>, Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn due_schedules(
        &self,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<ScheduleRecord>, Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn advance_schedule(
        &self,
        _key: &str,
        _seen_next_run: Option<DateTime<Utc>>,
        _next_run: Option<DateTime<Utc>>,
        _enabled: bool,
    ) -> Result<bool, Error> {
        Err(Error::Unsupported("schedules"))
    }

    async fn next_schedule_wake(&self) -> Result<Option<DateTime<Utc>>, Error> {
        Err(Error::Unsupported("schedules"))
    }
}
