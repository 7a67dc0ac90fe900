use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_database::{Capabilities, SqlitePool};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{event, Level};

use super::schema::SQLITE_SCHEMA;
use super::{failure_error, lease_timeout_error, parse_json_opt, to_json_string, RetentionReport};
use crate::backoff::RetryPolicy;
use crate::config::QueueConfig;
use crate::contract::{
    CompletionUpdate, EnqueueDisposition, EnqueueOutcome, EnqueueRequest, FailDisposition,
    FailureKind, FailureReport, ProgressUpdate, QueueBackend, QueueStats, ScheduleStore,
};
use crate::error::Error;
use crate::job::{JobRecord, JobRef, JobStatus};
use crate::scheduler::{ScheduleRecord, ScheduleTrigger};
use crate::stage::StageSet;
use crate::util::{from_millis, to_millis};

/// How many times the guarded claim update retries after losing the race
/// before reporting an empty queue.
const CLAIM_RETRIES: usize = 3;

/// Single-writer SQL driver. The pool is one connection wide, so every
/// write is serialized; claims use a candidate SELECT plus a guarded UPDATE
/// instead of row locks.
pub struct SqliteBackend {
    pool: SqlitePool,
    config: QueueConfig,
}

impl SqliteBackend {
    pub async fn connect(url: &str, config: QueueConfig) -> Result<SqliteBackend, Error> {
        let pool = relay_database::connect_sqlite(url).await?;
        let backend = SqliteBackend { pool, config };
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), Error> {
        for ddl in SQLITE_SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Prune terminal rows by age and per-status cap, and lazily fail
    /// expired-processing rows with no attempts left.
    async fn retention_sweep(&self) -> Result<RetentionReport, Error> {
        let now = Utc::now();
        let now_ms = to_millis(now);
        let mut report = RetentionReport::default();

        let timeout_err = to_json_string(&failure_error(
            "lease expired with no attempts left",
            "timeout",
            0,
            now,
        ))?;
        let expired = sqlx::query(
            r##"UPDATE queue_jobs
            SET status = 'failed', ended_at = ?, updated_at = ?,
                last_error = COALESCE(last_error, ?),
                locked_by = NULL, locked_at = NULL, expires_at = NULL
            WHERE status = 'processing' AND expires_at < ? AND attempts_made >= max_attempts"##,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(timeout_err)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        report.expired_failed = expired.rows_affected();

        for (status, age) in [
            (JobStatus::Completed, self.config.retention.completed_after),
            (JobStatus::Failed, self.config.retention.failed_after),
        ] {
            if let Some(age) = age {
                let cutoff = now_ms - age.as_millis() as i64;
                let removed = sqlx::query(
                    "DELETE FROM queue_jobs WHERE status = ? AND COALESCE(ended_at, updated_at) < ?",
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
                    WHERE status = ?1 AND id NOT IN (
                        SELECT id FROM queue_jobs WHERE status = ?1
                        ORDER BY COALESCE(ended_at, updated_at) DESC
                        LIMIT ?2
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

    async fn fetch_job(&self, id: &str) -> Result<Option<JobRecord>, Error> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn resolve_id(&self, job: &JobRef) -> Result<Option<String>, Error> {
        match job {
            JobRef::Id(id) => Ok(Some(id.clone())),
            JobRef::Key { queue, key } => {
                let row =
                    sqlx::query("SELECT id FROM queue_jobs WHERE queue = ? AND idempotency_key = ?")
                        .bind(queue)
                        .bind(key)
                        .fetch_optional(&self.pool)
                        .await?;
                Ok(row.map(|r| r.get::<String, _>("id")))
            }
        }
    }
}

fn initial_stage_state(req: &EnqueueRequest) -> Result<(Option<String>, Option<i64>), Error> {
    if req.stages.is_empty() {
        return Ok((None, None));
    }
    let set = StageSet::init(req.stages.iter().map(String::as_str));
    Ok((
        Some(to_json_string(&set.stages)?),
        set.overall().map(|p| p as i64),
    ))
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, Error> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| Error::Validation(format!("unknown job status {}", status_raw)))?;

    let backoff: RetryPolicy = parse_json_opt(row.try_get("backoff")?)?
        .unwrap_or_default();

    Ok(JobRecord {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: parse_json_opt(row.try_get("payload")?)?
            .unwrap_or(serde_json::Value::Null),
        status,
        priority: row.try_get::<Option<i64>, _>("priority")?.map(|p| p as i32),
        attempts_made: row.try_get::<i64, _>("attempts_made")? as i32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as i32,
        backoff,
        scheduled_for: row
            .try_get::<Option<i64>, _>("scheduled_for")?
            .map(from_millis),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        ended_at: row.try_get::<Option<i64>, _>("ended_at")?.map(from_millis),
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get::<Option<i64>, _>("locked_at")?.map(from_millis),
        expires_at: row.try_get::<Option<i64>, _>("expires_at")?.map(from_millis),
        last_error: parse_json_opt(row.try_get("last_error")?)?,
        stages: parse_json_opt(row.try_get("stages")?)?.unwrap_or_default(),
        current_stage: row.try_get("current_stage")?,
        overall_progress: row
            .try_get::<Option<i64>, _>("overall_progress")?
            .map(|p| p as u8),
        metadata: parse_json_opt(row.try_get("metadata")?)?,
        artifacts: parse_json_opt(row.try_get("artifacts")?)?,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<ScheduleRecord, Error> {
    let cron: Option<String> = row.try_get("cron")?;
    let interval_ms: Option<i64> = row.try_get("interval_ms")?;
    let run_at: Option<i64> = row.try_get("run_at")?;
    let trigger = match (cron, interval_ms, run_at) {
        (Some(expr), _, _) => ScheduleTrigger::Cron(expr),
        (None, Some(ms), _) => ScheduleTrigger::Every(Duration::from_millis(ms as u64)),
        (None, None, Some(at)) => ScheduleTrigger::At(from_millis(at)),
        (None, None, None) => {
            return Err(Error::Validation("schedule row has no trigger".into()))
        }
    };

    Ok(ScheduleRecord {
        key: row.try_get("key")?,
        queue: row.try_get("queue")?,
        trigger,
        payload: parse_json_opt(row.try_get("payload")?)?
            .unwrap_or(serde_json::Value::Null),
        limit: row.try_get::<Option<i64>, _>("limit")?.map(|l| l as u32),
        end_date: row.try_get::<Option<i64>, _>("end_date")?.map(from_millis),
        next_run_at: row
            .try_get::<Option<i64>, _>("next_run_at")?
            .map(from_millis),
        run_count: row.try_get::<i64, _>("run_count")? as u32,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn trigger_columns(trigger: &ScheduleTrigger) -> (Option<String>, Option<i64>, Option<i64>) {
    match trigger {
        ScheduleTrigger::Cron(expr) => (Some(expr.clone()), None, None),
        ScheduleTrigger::Every(d) => (None, Some(d.as_millis() as i64), None),
        ScheduleTrigger::At(at) => (None, None, Some(to_millis(*at))),
    }
}

const CANDIDATE_SQL: &str = r##"SELECT id, status, locked_by, attempts_made
    FROM queue_jobs
    WHERE queue = ?1 AND (
        (status IN ('pending', 'retry_pending') AND (scheduled_for IS NULL OR scheduled_for <= ?2))
        OR (status = 'processing' AND expires_at < ?2 AND attempts_made < max_attempts)
    )
    ORDER BY (status = 'processing') DESC,
        (priority IS NULL) ASC, priority DESC,
        created_at ASC, id ASC
    LIMIT 1"##;

const CLAIM_SQL: &str = r##"UPDATE queue_jobs SET
        status = 'processing',
        locked_by = ?1,
        locked_at = ?2,
        expires_at = ?3,
        started_at = COALESCE(started_at, ?2),
        attempts_made = attempts_made + 1,
        last_error = COALESCE(?4, last_error),
        updated_at = ?2
    WHERE id = ?5 AND status = ?6 AND COALESCE(locked_by, '') = ?7"##;

#[async_trait]
impl QueueBackend for SqliteBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SQLITE
    }

    async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueOutcome, Error> {
        let now = Utc::now();
        let now_ms = to_millis(now);
        let scheduled_ms = req.scheduled_for.map(to_millis);
        let payload = to_json_string(&req.payload)?;
        let backoff = to_json_string(&req.backoff)?;
        let (stages, overall) = initial_stage_state(&req)?;
        let metadata = req
            .metadata
            .as_ref()
            .map(to_json_string)
            .transpose()?;

        let insert_sql = r##"INSERT INTO queue_jobs
            (id, queue, idempotency_key, payload, status, priority, attempts_made,
             max_attempts, backoff, scheduled_for, created_at, updated_at,
             stages, overall_progress, metadata)
            VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)"##;

        let key = match &req.idempotency_key {
            None => {
                sqlx::query(insert_sql)
                    .bind(&req.id)
                    .bind(&req.queue)
                    .bind(Option::<String>::None)
                    .bind(&payload)
                    .bind(req.priority)
                    .bind(req.max_attempts)
                    .bind(&backoff)
                    .bind(scheduled_ms)
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(&stages)
                    .bind(overall)
                    .bind(&metadata)
                    .execute(&self.pool)
                    .await?;
                return Ok(EnqueueOutcome {
                    id: req.id,
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                });
            }
            Some(key) => key.clone(),
        };

        if !req.replace_if_not_active {
            // Insert-or-ignore; a key collision keeps the existing job.
            let inserted = sqlx::query(&format!("{} ON CONFLICT DO NOTHING", insert_sql))
                .bind(&req.id)
                .bind(&req.queue)
                .bind(&key)
                .bind(&payload)
                .bind(req.priority)
                .bind(req.max_attempts)
                .bind(&backoff)
                .bind(scheduled_ms)
                .bind(now_ms)
                .bind(now_ms)
                .bind(&stages)
                .bind(overall)
                .bind(&metadata)
                .execute(&self.pool)
                .await?;

            if inserted.rows_affected() == 1 {
                return Ok(EnqueueOutcome {
                    id: req.id,
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                });
            }
            let existing =
                sqlx::query("SELECT id FROM queue_jobs WHERE queue = ? AND idempotency_key = ?")
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

        // Replace-if-not-active. The single-connection pool serializes this
        // transaction against every other writer.
        let mut tx = self.pool.begin().await?;
        let existing =
            sqlx::query("SELECT id, status FROM queue_jobs WHERE queue = ? AND idempotency_key = ?")
                .bind(&req.queue)
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            None => {
                sqlx::query(insert_sql)
                    .bind(&req.id)
                    .bind(&req.queue)
                    .bind(&key)
                    .bind(&payload)
                    .bind(req.priority)
                    .bind(req.max_attempts)
                    .bind(&backoff)
                    .bind(scheduled_ms)
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(&stages)
                    .bind(overall)
                    .bind(&metadata)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(EnqueueOutcome {
                    id: req.id,
                    disposition: EnqueueDisposition::Inserted,
                    scheduled_for: req.scheduled_for,
                })
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
                        payload = ?, priority = ?, scheduled_for = ?, max_attempts = ?,
                        backoff = ?, stages = ?, current_stage = NULL,
                        overall_progress = ?, metadata = ?,
                        status = 'pending', attempts_made = 0, last_error = NULL,
                        locked_by = NULL, locked_at = NULL, expires_at = NULL,
                        started_at = NULL, ended_at = NULL, artifacts = NULL,
                        updated_at = ?
                    WHERE id = ?"##,
                )
                .bind(&payload)
                .bind(req.priority)
                .bind(scheduled_ms)
                .bind(req.max_attempts)
                .bind(&backoff)
                .bind(&stages)
                .bind(overall)
                .bind(&metadata)
                .bind(now_ms)
                .bind(&existing_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(EnqueueOutcome {
                    id: existing_id,
                    disposition: EnqueueDisposition::Replaced,
                    scheduled_for: req.scheduled_for,
                })
            }
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        for _ in 0..CLAIM_RETRIES {
            let now = Utc::now();
            let now_ms = to_millis(now);

            let candidate = sqlx::query(CANDIDATE_SQL)
                .bind(queue)
                .bind(now_ms)
                .fetch_optional(&self.pool)
                .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let id: String = candidate.get("id");
            let old_status: String = candidate.get("status");
            let old_locked: Option<String> = candidate.get("locked_by");
            let attempts: i64 = candidate.get("attempts_made");

            let timeout_err = if old_status == JobStatus::Processing.as_str() {
                Some(to_json_string(&lease_timeout_error(
                    attempts as i32,
                    lease.as_millis() as u64,
                    now,
                ))?)
            } else {
                None
            };

            let expires_ms = now_ms + lease.as_millis() as i64;
            let updated = sqlx::query(CLAIM_SQL)
                .bind(worker)
                .bind(now_ms)
                .bind(expires_ms)
                .bind(timeout_err)
                .bind(&id)
                .bind(&old_status)
                .bind(old_locked.unwrap_or_default())
                .execute(&self.pool)
                .await?;

            if updated.rows_affected() == 1 {
                return self.fetch_job(&id).await;
            }
            // Lost the race to another consumer; take another look.
        }
        Ok(None)
    }

    async fn heartbeat(&self, id: &str, worker: &str, lease: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        let expires_ms = to_millis(now) + lease.as_millis() as i64;
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET expires_at = ?, updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'"##,
        )
        .bind(expires_ms)
        .bind(to_millis(now))
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
        let now_ms = to_millis(Utc::now());
        let stages = update.stages.as_ref().map(to_json_string).transpose()?;
        let artifacts = update.artifacts.as_ref().map(to_json_string).transpose()?;

        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'completed', ended_at = ?, updated_at = ?,
                stages = COALESCE(?, stages),
                current_stage = COALESCE(?, current_stage),
                overall_progress = COALESCE(?, overall_progress),
                artifacts = COALESCE(?, artifacts),
                locked_by = NULL, locked_at = NULL, expires_at = NULL
            WHERE id = ? AND locked_by = ? AND status = 'processing'"##,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(stages)
        .bind(update.current_stage)
        .bind(update.overall_progress.map(|p| p as i64))
        .bind(artifacts)
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
        let now_ms = to_millis(now);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r##"SELECT attempts_made, max_attempts, backoff FROM queue_jobs
            WHERE id = ? AND locked_by = ? AND status = 'processing'"##,
        )
        .bind(id)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailDisposition::NotOwned);
        };

        let attempts: i64 = row.get("attempts_made");
        let max_attempts: i64 = row.get("max_attempts");
        let backoff: RetryPolicy =
            parse_json_opt(row.get::<Option<String>, _>("backoff"))?.unwrap_or_default();

        let last_error = to_json_string(&failure_error(
            &report.message,
            report.kind.as_str(),
            attempts as i32,
            now,
        ))?;

        let retryable = report.kind == FailureKind::Retryable && attempts < max_attempts;
        if retryable {
            let delay =
                backoff.delay_with_jitter(attempts as u32, self.config.jitter_factor);
            let at = crate::util::after(now, delay);
            sqlx::query(
                r##"UPDATE queue_jobs SET
                    status = 'retry_pending', scheduled_for = ?, last_error = ?,
                    locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = ?
                WHERE id = ?"##,
            )
            .bind(to_millis(at))
            .bind(&last_error)
            .bind(now_ms)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(FailDisposition::RetryPending { at })
        } else {
            sqlx::query(
                r##"UPDATE queue_jobs SET
                    status = 'failed', ended_at = ?, last_error = ?,
                    locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = ?
                WHERE id = ?"##,
            )
            .bind(now_ms)
            .bind(&last_error)
            .bind(now_ms)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(FailDisposition::Failed)
        }
    }

    async fn reschedule(&self, id: &str, worker: &str, delay: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        let at = crate::util::after(now, delay);
        // Rate limits are not failures: the attempt is handed back.
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'pending', scheduled_for = ?,
                attempts_made = MAX(attempts_made - 1, 0),
                locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'"##,
        )
        .bind(to_millis(at))
        .bind(to_millis(now))
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
        let stages = update.stages.as_ref().map(to_json_string).transpose()?;
        let artifacts = update.artifacts.as_ref().map(to_json_string).transpose()?;
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                stages = COALESCE(?, stages),
                current_stage = COALESCE(?, current_stage),
                overall_progress = COALESCE(?, overall_progress),
                artifacts = COALESCE(?, artifacts),
                updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'"##,
        )
        .bind(stages)
        .bind(update.current_stage)
        .bind(update.overall_progress.map(|p| p as i64))
        .bind(artifacts)
        .bind(to_millis(Utc::now()))
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
            "DELETE FROM queue_jobs WHERE id = ? AND status IN ('pending', 'retry_pending')",
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
        let now_ms = to_millis(Utc::now());
        // Attempts are preserved; the cap moves up so the retry itself does
        // not immediately exhaust the job.
        let updated = sqlx::query(
            r##"UPDATE queue_jobs SET
                status = 'pending', scheduled_for = ?,
                max_attempts = MAX(max_attempts, attempts_made + 1),
                locked_by = NULL, locked_at = NULL, expires_at = NULL,
                ended_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'"##,
        )
        .bind(now_ms)
        .bind(now_ms)
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
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END) AS processing,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                SUM(CASE WHEN status = 'retry_pending' THEN 1 ELSE 0 END) AS retry_pending
            FROM queue_jobs{}"##,
            if queue.is_some() { " WHERE queue = ?" } else { "" }
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
impl ScheduleStore for SqliteBackend {
    async fn upsert_schedule(&self, record: &ScheduleRecord) -> Result<(), Error> {
        let (cron, interval_ms, run_at) = trigger_columns(&record.trigger);
        let now_ms = to_millis(Utc::now());
        sqlx::query(
            r##"INSERT INTO queue_schedules
                (key, queue, cron, interval_ms, run_at, payload, "limit", end_date,
                 run_count, next_run_at, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                queue = excluded.queue,
                cron = excluded.cron,
                interval_ms = excluded.interval_ms,
                run_at = excluded.run_at,
                payload = excluded.payload,
                "limit" = excluded."limit",
                end_date = excluded.end_date,
                run_count = excluded.run_count,
                next_run_at = excluded.next_run_at,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at"##,
        )
        .bind(&record.key)
        .bind(&record.queue)
        .bind(cron)
        .bind(interval_ms)
        .bind(run_at)
        .bind(to_json_string(&record.payload)?)
        .bind(record.limit.map(|l| l as i64))
        .bind(record.end_date.map(to_millis))
        .bind(record.run_count as i64)
        .bind(record.next_run_at.map(to_millis))
        .bind(record.enabled as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> Result<bool, Error> {
        let removed = sqlx::query("DELETE FROM queue_schedules WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(removed.rows_affected() == 1)
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<ScheduleRecord>, Error> {
        let row = sqlx::query("SELECT * FROM queue_schedules WHERE key = ?")
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
            WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at ASC
            LIMIT ?"##,
        )
        .bind(to_millis(now))
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
                next_run_at = ?, run_count = run_count + 1, enabled = ?, updated_at = ?
            WHERE key = ? AND enabled = 1 AND COALESCE(next_run_at, -1) = COALESCE(?, -1)"##,
        )
        .bind(next_run.map(to_millis))
        .bind(enabled as i64)
        .bind(to_millis(Utc::now()))
        .bind(key)
        .bind(seen_next_run.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn next_schedule_wake(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let row = sqlx::query(
            "SELECT MIN(next_run_at) AS wake FROM queue_schedules WHERE enabled = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("wake")?.map(from_millis))
    }
}
