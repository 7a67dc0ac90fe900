use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_database::{Capabilities, PostgresPool};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{event, Level};

use super::schema::POSTGRES_SCHEMA;
use super::{failure_error, RetentionReport};
use crate::backoff::RetryPolicy;
use crate::config::QueueConfig;
use crate::contract::{
    CompletionUpdate, EnqueueDisposition, EnqueueOutcome, EnqueueRequest, FailDisposition,
    FailureKind, FailureReport, ProgressUpdate, QueueBackend, QueueStats, ScheduleStore,
};
use crate::error::Error;
use crate::job::{JobRecord, JobRef, JobStatus};
use crate::scheduler::{ScheduleRecord, ScheduleTrigger};
use crate::stage::{Stage, StageSet};
use crate::util::after;

/// Channel used to wake cross-process waiters when a job lands. The payload
/// is the queue name.
pub(crate) const NOTIFY_CHANNEL: &str = "relay_queue_jobs";

/// Row-locking SQL driver. `FOR UPDATE SKIP LOCKED` makes the claim a
/// single statement with true at-most-one delivery under contention, and
/// NOTIFY/LISTEN bridges enqueues into the push waitlist across processes.
pub struct PostgresBackend {
    pool: PostgresPool,
    config: QueueConfig,
}

impl PostgresBackend {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        config: QueueConfig,
    ) -> Result<PostgresBackend, Error> {
        let pool = relay_database::connect_postgres(url, max_connections).await?;
        let backend = PostgresBackend { pool, config };
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), Error> {
        for ddl in POSTGRES_SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn notify(&self, queue: &str) -> Result<(), Error> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retention_sweep(&self) -> Result<RetentionReport, Error> {
        let now = Utc::now();
        let mut report = RetentionReport::default();

        let timeout_err = serde_json::to_value(failure_error(
            "lease expired with no attempts left",
            "timeout",
            0,
            now,
        ))?;
        let expired = sqlx::query(
            r##"UPDATE queue_jobs
            SET status = 'failed', ended_at = $1, updated_at = $1,
                last_error = COALESCE(last_error, $2),
                locked_by = NULL, locked_at = NULL, expires_at = NULL
            WHERE status = 'processing' AND expires_at < $1 AND attempts_made >= max_attempts"##,
        )
        .bind(now)
        .bind(timeout_err)
        .execute(&self.pool)
        .await?;
        report.expired_failed = expired.rows_affected();

        for (status, age) in [
            (JobStatus::Completed, self.config.retention.completed_after),
            (JobStatus::Failed, self.config.retention.failed_after),
        ] {
            if let Some(age) = age {
                let cutoff = now - chrono::Duration::milliseconds(age.as_millis() as i64);
                let removed = sqlx::query(
                    "DELETE FROM queue_jobs WHERE status = $1 AND COALESCE(ended_at, updated_at) < $2",
                )
                .bind(status.as_str())
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
                report.removed_by_age += removed.rows_affected();
            }
        }

        if let Some(cap) = self.config.retention.max_per_status {
            for status in [JobStatus::Completed, JobStatus::Failed] {
                let removed = sqlx::query(
                    r##"DELETE FROM queue_jobs
                    WHERE status = $1 AND id NOT IN (
                        SELECT id FROM queue_jobs WHERE status = $1
                        ORDER BY COALESCE(ended_at, updated_at) DESC
                        LIMIT $2
                    )"##,
                )
                .bind(status.as_str())
                .bind(cap as i64)
                .execute(&self.pool)
                .await?;
                report.removed_by_count += removed.rows_affected();
            }
        }

        if report != RetentionReport::default() {
            event!(Level::INFO, ?report, "Queue retention sweep");
        }
        Ok(report)
    }

    async fn resolve_id(&self, job: &JobRef) -> Result<Option<String>, Error> {
        match job {
            JobRef::Id(id) => Ok(Some(id.clone())),
            JobRef::Key { queue, key } => {
                let row = sqlx::query(
                    "SELECT id FROM queue_jobs WHERE queue = $1 AND idempotency_key = $2",
                )
                .bind(queue)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| r.get::<String, _>("id")))
            }
        }
    }

    async fn fetch_job(&self, id: &str) -> Result<Option<JobRecord>, Error> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> Result<Option<T>, Error> {
    value
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .transpose()
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, Error> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| Error::Validation(format!("unknown job status {}", status_raw)))?;

    let stages: Option<Vec<Stage>> = from_json(row.try_get("stages")?)?;
    let backoff: RetryPolicy = from_json(row.try_get("backoff")?)?.unwrap_or_default();

    Ok(JobRecord {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        status,
        priority: row.try_get("priority")?,
        attempts_made: row.try_get("attempts_made")?,
        max_attempts: row.try_get("max_attempts")?,
        backoff,
        scheduled_for: row.try_get("scheduled_for")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        expires_at: row.try_get("expires_at")?,
        last_error: from_json(row.try_get("last_error")?)?,
        stages: stages.unwrap_or_default(),
        current_stage: row.try_get("current_stage")?,
        overall_progress: row
            .try_get::<Option<i32>, _>("overall_progress")?
            .map(|p| p as u8),
        metadata: from_json(row.try_get("metadata")?)?,
        artifacts: row.try_get("artifacts")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduleRecord, Error> {
    let cron: Option<String> = row.try_get("cron")?;
    let interval_ms: Option<i64> = row.try_get("interval_ms")?;
    let run_at: Option<DateTime<Utc>> = row.try_get("run_at")?;
    let trigger = match (cron, interval_ms, run_at) {
        (Some(expr), _, _) => ScheduleTrigger::Cron(expr),
        (None, Some(ms), _) => ScheduleTrigger::Every(Duration::from_millis(ms as u64)),
        (None, None, Some(at)) => ScheduleTrigger::At(at),
        (None, None, None) => {
            return Err(Error::Validation("schedule row has no trigger".into()))
        }
    };

    Ok(ScheduleRecord {
        key: row.try_get("key")?,
        queue: row.try_get("queue")?,
        trigger,
        payload: row.try_get("payload")?,
        limit: row.try_get::<Option<i32>, _>("limit")?.map(|l| l as u32),
        end_date: row.try_get("end_date")?,
        next_run_at: row.try_get("next_run_at")?,
        run_count: row.try_get::<i32, _>("run_count")? as u32,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn initial_stage_state(
    req: &EnqueueRequest,
) -> Result<(Option<serde_json::Value>, Option<i32>), Error> {
    if req.stages.is_empty() {
        return Ok((None, None));
    }
    let set = StageSet::init(req.stages.iter().map(String::as_str));
    Ok((
        Some(serde_json::to_value(&set.stages)?),
        set.overall().map(|p| p as i32),
    ))
}

const INSERT_SQL: &str = r##"INSERT INTO queue_jobs
    (id, queue, idempotency_key, payload, status, priority, attempts_made,
     max_attempts, backoff, scheduled_for, created_at, updated_at,
     stages, overall_progress, metadata)
    VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6, $7, $8, $9, $9, $10, $11, $12)"##;

/// The claim: expired-lease recovery first, then priority, then FIFO; the
/// whole transition is one statement thanks to SKIP LOCKED.
const CLAIM_SQL: &str = r##"UPDATE queue_jobs SET
        status = 'processing',
        locked_by = $2,
        locked_at = $3,
        expires_at = $4,
        started_at = COALESCE(started_at, $3),
        attempts_made = attempts_made + 1,
        last_error = CASE WHEN queue_jobs.status = 'processing'
            THEN jsonb_build_object(
                'message', $5::text,
                'kind', 'timeout',
                'attempt', queue_jobs.attempts_made,
                'at', $3::timestamptz)
            ELSE last_error END,
        updated_at = $3
    WHERE id = (
        SELECT id FROM queue_jobs
        WHERE queue = $1 AND (
            (status IN ('pending', 'retry_pending')
                AND (scheduled_for IS NULL OR scheduled_for <= $3))
            OR (status = 'processing' AND expires_at < $3 AND attempts_made < max_attempts)
        )
        ORDER BY (status = 'processing' AND expires_at < $3) DESC,
            priority DESC NULLS LAST,
            created_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING *"##;

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::POSTGRES
    }

    async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueOutcome, Error> {
        let now = Utc::now();
        let backoff = serde_json::to_value(req.backoff)?;
        let (stages, overall) = initial_stage_state(&req)?;
        let metadata = req
            .metadata
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let key = match &req.idempotency_key {
            None => {
                sqlx::query(INSERT_SQL)
                    .bind(&req.id)
                    .bind(&req.queue)
                    .bind(Option::<String>::None)
                    .bind(&req.payload)
                    .bind(req.priority)
                    .bind(req.max_attempts)
                    .bind(&backoff)
                    .bind(req.scheduled_for)
                    .bind(now)
                    .bind(&stages)
                    .bind(overall)
                    .bind(&metadata)
                    .execute(&self.pool)
                    .await?;
                self.notify(&req.queue).await?;
                return Ok(EnqueueOutcome {
                    id: req.id,
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                });
            }
            Some(key) => key.clone(),
        };

        if !req.replace_if_not_active {
            let inserted = sqlx::query(&format!("{} ON CONFLICT DO NOTHING", INSERT_SQL))
                .bind(&req.id)
                .bind(&req.queue)
                .bind(&key)
                .bind(&req.payload)
                .bind(req.priority)
                .bind(req.max_attempts)
                .bind(&backoff)
                .bind(req.scheduled_for)
                .bind(now)
                .bind(&stages)
                .bind(overall)
                .bind(&metadata)
                .execute(&self.pool)
                .await?;

            if inserted.rows_affected() == 1 {
                self.notify(&req.queue).await?;
                return Ok(EnqueueOutcome {
                    id: req.id,
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                });
            }
            let existing = sqlx::query(
                "SELECT id FROM queue_jobs WHERE queue = $1 AND idempotency_key = $2",
            )
            .bind(&req.queue)
            .bind(&key)
            .fetch_one(&self.pool)
            .await?;
            return Ok(EnqueueOutcome {
                id: existing.get("id"),
                disposition: EnqueueDisposition::ExistingKept,
                scheduled_for: None,
            });
        }

        // Replace-if-not-active, with the existing row locked for the
        // duration of the decision.
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, status FROM queue_jobs WHERE queue = $1 AND idempotency_key = $2 FOR UPDATE",
        )
        .bind(&req.queue)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(INSERT_SQL)
                    .bind(&req.id)
                    .bind(&req.queue)
                    .bind(&key)
                    .bind(&req.payload)
                    .bind(req.priority)
                    .bind(req.max_attempts)
                    .bind(&backoff)
                    .bind(req.scheduled_for)
                    .bind(now)
                    .bind(&stages)
                    .bind(overall)
                    .bind(&metadata)
                    .execute(&mut *tx)
                    .await?;
                EnqueueOutcome {
                    id: req.id.clone(),
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                }
            }
            Some(row) => {
                let existing_id: String = row.get("id");
                let status: String = row.get("status");
                if status == JobStatus::Processing.as_str() {
                    return Err(Error::AlreadyActive {
                        queue: req.queue,
                        key,
                        id: existing_id,
                    });
                }

                sqlx::query(
                    r##"UPDATE queue_jobs SET
                        payload = $1, priority = $2, scheduled_for = $3, max_attempts = $4,
                        backoff = $5, stages = $6, current_stage = NULL,
                        overall_progress = $7, metadata = $8,
                        status = 'pending', attempts_made = 0, last_error = NULL,
                        locked_by = NULL, locked_at = NULL, expires_at = NULL,
                        started_at = NULL, ended_at = NULL, artifacts = NULL,
                        updated_at = $9
                    WHERE id = $10"##,
                )
                .bind(&req.payload)
                .bind(req.priority)
                .bind(req.scheduled_for)
                .bind(req.max_attempts)
                .bind(&backoff)
                .bind(&stages)
                .bind(overall)
                .bind(&metadata)
                .bind(now)
                .bind(&existing_id)
                .execute(&mut *tx)
                .await?;
                EnqueueOutcome {
                    id: existing_id,
                    disposition: EnqueueDisposition::Replaced,
                    scheduled_for: req.scheduled_for,
                }
            }
        };
        tx.commit().await?;
        self.notify(&req.queue).await?;
        Ok(outcome)
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        let now = Utc::now();
        let timeout_message = format!("lease expired after {}ms", lease.as_millis());
        let row = sqlx::query(CLAIM_SQL)
            .bind(queue)
            .bind(worker)
            .bind(now)
            .bind(after(now, lease))
            .bind(&timeout_message)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn heartbeat(&self, id: &str, worker: &str, lease: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET expires_at = $1, updated_at = $2
            WHERE id = $3 AND locked_by = $4 AND status = 'processing'"##,
        )
        .bind(after(now, lease))
        .bind(now)
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: &str,
        worker: &str,
        update: CompletionUpdate,
    ) -> Result<bool, Error> {
        let now = Utc::now();
        let stages = update
            .stages
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'completed', ended_at = $1, updated_at = $1,
                stages = COALESCE($2, stages),
                current_stage = COALESCE($3, current_stage),
                overall_progress = COALESCE($4, overall_progress),
                artifacts = COALESCE($5, artifacts),
                locked_by = NULL, locked_at = NULL, expires_at = NULL
            WHERE id = $6 AND locked_by = $7 AND status = 'processing'"##,
        )
        .bind(now)
        .bind(&stages)
        .bind(&update.current_stage)
        .bind(update.overall_progress.map(|p| p as i32))
        .bind(&update.artifacts)
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: &str,
        worker: &str,
        report: FailureReport,
    ) -> Result<FailDisposition, Error> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r##"SELECT attempts_made, max_attempts, backoff FROM queue_jobs
            WHERE id = $1 AND locked_by = $2 AND status = 'processing'
            FOR UPDATE"##,
        )
        .bind(id)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailDisposition::NotOwned);
        };

        let attempts: i32 = row.get("attempts_made");
        let max_attempts: i32 = row.get("max_attempts");
        let backoff: RetryPolicy =
            from_json(row.get::<Option<serde_json::Value>, _>("backoff"))?.unwrap_or_default();

        let last_error = serde_json::to_value(failure_error(
            &report.message,
            report.kind.as_str(),
            attempts,
            now,
        ))?;

        let retryable = report.kind == FailureKind::Retryable && attempts < max_attempts;
        if retryable {
            let delay = backoff.delay_with_jitter(attempts as u32, self.config.jitter_factor);
            let at = after(now, delay);
            sqlx::query(
                r##"UPDATE queue_jobs SET
                    status = 'retry_pending', scheduled_for = $1, last_error = $2,
                    locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = $3
                WHERE id = $4"##,
            )
            .bind(at)
            .bind(&last_error)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(FailDisposition::RetryPending { at })
        } else {
            sqlx::query(
                r##"UPDATE queue_jobs SET
                    status = 'failed', ended_at = $1, last_error = $2,
                    locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = $1
                WHERE id = $3"##,
            )
            .bind(now)
            .bind(&last_error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(FailDisposition::Failed)
        }
    }

    async fn reschedule(&self, id: &str, worker: &str, delay: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        let at = after(now, delay);
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'pending', scheduled_for = $1,
                attempts_made = GREATEST(attempts_made - 1, 0),
                locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = $2
            WHERE id = $3 AND locked_by = $4 AND status = 'processing'"##,
        )
        .bind(at)
        .bind(now)
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn update_progress(
        &self,
        id: &str,
        worker: &str,
        update: ProgressUpdate,
    ) -> Result<bool, Error> {
        let stages = update
            .stages
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                stages = COALESCE($1, stages),
                current_stage = COALESCE($2, current_stage),
                overall_progress = COALESCE($3, overall_progress),
                artifacts = COALESCE($4, artifacts),
                updated_at = $5
            WHERE id = $6 AND locked_by = $7 AND status = 'processing'"##,
        )
        .bind(&stages)
        .bind(&update.current_stage)
        .bind(update.overall_progress.map(|p| p as i32))
        .bind(&update.artifacts)
        .bind(Utc::now())
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn cancel(&self, job: &JobRef) -> Result<bool, Error> {
        let Some(id) = self.resolve_id(job).await? else {
            return Ok(false);
        };
        let removed = sqlx::query(
            "DELETE FROM queue_jobs WHERE id = $1 AND status IN ('pending', 'retry_pending')",
        )
        .bind(&id)
        .execute(&self.pool)
        .await?;
        Ok(removed.rows_affected() == 1)
    }

    async fn retry(&self, job: &JobRef) -> Result<bool, Error> {
        let Some(id) = self.resolve_id(job).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'pending', scheduled_for = $1,
                max_attempts = GREATEST(max_attempts, attempts_made + 1),
                locked_by = NULL, locked_at = NULL, expires_at = NULL,
                ended_at = NULL, updated_at = $1
            WHERE id = $2 AND status = 'failed'"##,
        )
        .bind(now)
        .bind(&id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn get_job(&self, job: &JobRef) -> Result<Option<JobRecord>, Error> {
        let Some(id) = self.resolve_id(job).await? else {
            return Ok(None);
        };
        self.fetch_job(&id).await
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, Error> {
        let sql = format!(
            r##"SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'retry_pending') AS retry_pending
            FROM queue_jobs{}"##,
            if queue.is_some() { " WHERE queue = $1" } else { "" }
        );
        let mut query = sqlx::query(&sql);
        if let Some(queue) = queue {
            query = query.bind(queue);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            processing: row.try_get::<Option<i64>, _>("processing")?.unwrap_or(0),
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
            retry_pending: row
                .try_get::<Option<i64>, _>("retry_pending")?
                .unwrap_or(0),
        })
    }

    async fn run_retention(&self) -> Result<RetentionReport, Error> {
        self.retention_sweep().await
    }
}

#[async_trait]
impl ScheduleStore for PostgresBackend {
    async fn upsert_schedule(&self, record: &ScheduleRecord) -> Result<(), Error> {
        let (cron, interval_ms, run_at) = match &record.trigger {
            ScheduleTrigger::Cron(expr) => (Some(expr.clone()), None, None),
            ScheduleTrigger::Every(d) => (None, Some(d.as_millis() as i64), None),
            ScheduleTrigger::At(at) => (None, None, Some(*at)),
        };
        let now = Utc::now();
        sqlx::query(
            r##"INSERT INTO queue_schedules
                (key, queue, cron, interval_ms, run_at, payload, "limit", end_date,
                 run_count, next_run_at, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            ON CONFLICT (key) DO UPDATE SET
                queue = EXCLUDED.queue,
                cron = EXCLUDED.cron,
                interval_ms = EXCLUDED.interval_ms,
                run_at = EXCLUDED.run_at,
                payload = EXCLUDED.payload,
                "limit" = EXCLUDED."limit",
                end_date = EXCLUDED.end_date,
                run_count = EXCLUDED.run_count,
                next_run_at = EXCLUDED.next_run_at,
                enabled = EXCLUDED.enabled,
                updated_at = EXCLUDED.updated_at"##,
        )
        .bind(&record.key)
        .bind(&record.queue)
        .bind(cron)
        .bind(interval_ms)
        .bind(run_at)
        .bind(&record.payload)
        .bind(record.limit.map(|l| l as i32))
        .bind(record.end_date)
        .bind(record.run_count as i32)
        .bind(record.next_run_at)
        .bind(record.enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> Result<bool, Error> {
        let removed = sqlx::query("DELETE FROM queue_schedules WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(removed.rows_affected() == 1)
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<ScheduleRecord>, Error> {
        let row = sqlx::query("SELECT * FROM queue_schedules WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| schedule_from_row(&r)).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, Error> {
        let rows = sqlx::query("SELECT * FROM queue_schedules ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduleRecord>, Error> {
        let rows = sqlx::query(
            r##"SELECT * FROM queue_schedules
            WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2"##,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn advance_schedule(
        &self,
        key: &str,
        seen_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<bool, Error> {
        let updated = sqlx::query(
            r##"UPDATE queue_schedules SET
                next_run_at = $1, run_count = run_count + 1, enabled = $2, updated_at = $3
            WHERE key = $4 AND enabled AND next_run_at IS NOT DISTINCT FROM $5"##,
        )
        .bind(next_run)
        .bind(enabled)
        .bind(Utc::now())
        .bind(key)
        .bind(seen_next_run)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn next_schedule_wake(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let row =
            sqlx::query("SELECT MIN(next_run_at) AS wake FROM queue_schedules WHERE enabled")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("wake")?)
    }
}

#[cfg(all(test, feature = "test_postgres"))]
mod tests {
    use super::*;
    use crate::contract::EnqueueDisposition;
    use crate::util::new_job_id;
    use futures::FutureExt;
    use std::future::Future;
    use std::sync::Arc;

    fn test_request(queue: &str, payload: serde_json::Value) -> EnqueueRequest {
        EnqueueRequest {
            id: new_job_id(),
            queue: queue.to_string(),
            payload,
            idempotency_key: None,
            priority: None,
            scheduled_for: None,
            max_attempts: 3,
            backoff: RetryPolicy::Fixed {
                base: Duration::from_millis(50),
            },
            stages: Vec::new(),
            metadata: None,
            replace_if_not_active: false,
        }
    }

    async fn run_pg_test<T, Fut>(test: T)
    where
        T: Send + Sync + FnOnce(Arc<PostgresBackend>, String) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        dotenv::dotenv().ok();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL is required");
        let queue_name = format!("test-{}", uuid::Uuid::new_v4());
        let mut config = QueueConfig::default();
        config.jitter_factor = 0.0;
        config.default_backoff = RetryPolicy::Fixed {
            base: Duration::from_millis(50),
        };
        let backend = Arc::new(
            PostgresBackend::connect(&url, 5, config)
                .await
                .expect("connecting postgres backend"),
        );

        let result = std::panic::AssertUnwindSafe(test(backend.clone(), queue_name.clone()))
            .catch_unwind()
            .await;

        sqlx::query("DELETE FROM queue_jobs WHERE queue = $1")
            .bind(&queue_name)
            .execute(backend.pool())
            .await
            .expect("Cleanup: deleting test jobs");

        result.expect("Panicked").expect("Error");
    }

    #[tokio::test]
    async fn enqueue_claim_complete() {
        run_pg_test(|backend, queue| async move {
            let outcome = backend
                .enqueue(test_request(&queue, serde_json::json!({"n": 1})))
                .await?;
            assert_eq!(outcome.disposition, EnqueueDisposition::Inserted);

            let job = backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .expect("claimable");
            assert_eq!(job.id, outcome.id);
            assert_eq!(job.attempts_made, 1);

            let completed = backend
                .complete(
                    &job.id,
                    "w1",
                    CompletionUpdate {
                        artifacts: Some(serde_json::json!({"ok": true})),
                        ..Default::default()
                    },
                )
                .await?;
            assert!(completed);

            let record = backend
                .get_job(&JobRef::Id(job.id))
                .await?
                .expect("record retained");
            assert_eq!(record.status, JobStatus::Completed);
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_claims_deliver_each_job_once() {
        run_pg_test(|backend, queue| async move {
            for n in 0..10 {
                backend
                    .enqueue(test_request(&queue, serde_json::json!({ "n": n })))
                    .await?;
            }

            let mut tasks = Vec::new();
            for w in 0..4 {
                let backend = backend.clone();
                let queue = queue.clone();
                tasks.push(tokio::spawn(async move {
                    let worker = format!("w{}", w);
                    let mut claimed = Vec::new();
                    while let Some(job) = backend
                        .claim(&queue, &worker, Duration::from_secs(30))
                        .await
                        .expect("claim")
                    {
                        claimed.push(job.id);
                    }
                    claimed
                }));
            }

            let mut all = Vec::new();
            for task in tasks {
                all.extend(task.await.expect("join"));
            }
            all.sort();
            let total = all.len();
            all.dedup();
            assert_eq!(total, 10, "every job delivered");
            assert_eq!(all.len(), 10, "no job delivered twice");
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_exhausts() {
        run_pg_test(|backend, queue| async move {
            let mut req = test_request(&queue, serde_json::json!({}));
            req.max_attempts = 2;
            let outcome = backend.enqueue(req).await?;

            backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .unwrap();
            let disposition = backend
                .fail(
                    &outcome.id,
                    "w1",
                    FailureReport {
                        message: "transient".to_string(),
                        kind: FailureKind::Retryable,
                    },
                )
                .await?;
            assert!(matches!(disposition, FailDisposition::RetryPending { .. }));

            tokio::time::sleep(Duration::from_millis(100)).await;
            backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .expect("retry due");
            let disposition = backend
                .fail(
                    &outcome.id,
                    "w1",
                    FailureReport {
                        message: "transient".to_string(),
                        kind: FailureKind::Retryable,
                    },
                )
                .await?;
            assert!(matches!(disposition, FailDisposition::Failed));
            Ok(())
        })
        .await;
    }
}
