//! Redis driver. The contract maps onto ZSET/LIST/HASH primitives with one
//! Lua script per atomic transition: pending and scheduled sets order the
//! queue, a processing set carries lease expiries, and a hash per job holds
//! its record under short field names.

mod cancel_retry;
mod claim;
mod complete;
mod enqueue;
mod fail;
mod heartbeat;
mod job_data;
mod progress;
mod reschedule;
mod schedule;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use relay_database::{Capabilities, RedisPool};

use self::cancel_retry::{CancelScript, RetryScript};
use self::claim::ClaimScript;
use self::complete::CompleteScript;
use self::enqueue::{EnqueueArgs, EnqueueScript};
use self::fail::{FailScript, FailScriptOutcome};
use self::heartbeat::HeartbeatScript;
use self::job_data::{id_from_member, record_from_hash, RedisJobField};
use self::progress::ProgressScript;
use self::reschedule::RescheduleScript;
use self::schedule::AdvanceScheduleScript;
use crate::backoff::RetryPolicy;
use crate::config::QueueConfig;
use crate::contract::{
    CompletionUpdate, EnqueueOutcome, EnqueueRequest, FailDisposition, FailureKind, FailureReport,
    ProgressUpdate, QueueBackend, QueueStats, ScheduleStore,
};
use crate::error::Error;
use crate::job::{JobRecord, JobRef, LastError};
use crate::scheduler::{ScheduleRecord, ScheduleTrigger};
use crate::stage::StageSet;
use crate::util::{from_millis, to_millis};

const DEFAULT_ROOT: &str = "rlq";

/// All per-queue key names, computed once per call site.
pub(crate) struct QueueKeys {
    pub pending: String,
    pub scheduled: String,
    pub processing: String,
    pub stats: String,
    pub done: String,
    pub dead: String,
    pub idempotency: String,
    pub queues_set: String,
}

pub struct RedisBackend {
    pool: RedisPool,
    config: QueueConfig,
    root: String,

    enqueue_script: EnqueueScript,
    claim_script: ClaimScript,
    complete_script: CompleteScript,
    fail_script: FailScript,
    heartbeat_script: HeartbeatScript,
    reschedule_script: RescheduleScript,
    cancel_script: CancelScript,
    retry_script: RetryScript,
    progress_script: ProgressScript,
    advance_script: AdvanceScheduleScript,
}

impl RedisBackend {
    pub fn new(pool: RedisPool, config: QueueConfig) -> RedisBackend {
        let root = pool
            .key_prefix()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());
        RedisBackend {
            pool,
            config,
            root,
            enqueue_script: EnqueueScript::new(),
            claim_script: ClaimScript::new(),
            complete_script: CompleteScript::new(),
            fail_script: FailScript::new(),
            heartbeat_script: HeartbeatScript::new(),
            reschedule_script: RescheduleScript::new(),
            cancel_script: CancelScript::new(),
            retry_script: RetryScript::new(),
            progress_script: ProgressScript::new(),
            advance_script: AdvanceScheduleScript::new(),
        }
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys {
            pending: format!("{}:{}:pending", self.root, queue),
            scheduled: format!("{}:{}:scheduled", self.root, queue),
            processing: format!("{}:{}:processing", self.root, queue),
            stats: format!("{}:{}:stats", self.root, queue),
            done: format!("{}:{}:done", self.root, queue),
            dead: format!("{}:{}:dead", self.root, queue),
            idempotency: format!("{}:{}:keys", self.root, queue),
            queues_set: self.queues_set(),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.root)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    fn queues_set(&self) -> String {
        format!("{}:queues", self.root)
    }

    fn schedules_zset(&self) -> String {
        format!("{}:schedules", self.root)
    }

    fn schedule_keys_set(&self) -> String {
        format!("{}:sched-keys", self.root)
    }

    fn schedule_hash(&self, key: &str) -> String {
        format!("{}:sched:{}", self.root, key)
    }

    fn retention_ttl_ms(&self, completed: bool) -> Option<i64> {
        let age = if completed {
            self.config.retention.completed_after
        } else {
            self.config.retention.failed_after
        };
        age.map(|d| d.as_millis() as i64)
    }

    async fn read_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        id: &str,
    ) -> Result<Option<JobRecord>, Error> {
        let map: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        record_from_hash(id, &map)
    }

    /// Resolve a job reference to (id, queue). Ids carry their queue in the
    /// job hash; keys resolve through the per-queue idempotency hash.
    async fn resolve(
        &self,
        conn: &mut deadpool_redis::Connection,
        job: &JobRef,
    ) -> Result<Option<(String, String)>, Error> {
        match job {
            JobRef::Id(id) => {
                let queue: Option<String> = conn
                    .hget(self.job_key(id), RedisJobField::Queue)
                    .await?;
                Ok(queue.map(|q| (id.clone(), q)))
            }
            JobRef::Key { queue, key } => {
                let keys = self.keys(queue);
                let id: Option<String> = conn.hget(&keys.idempotency, key).await?;
                Ok(id.map(|id| (id, queue.clone())))
            }
        }
    }

    async fn stats_for_queue(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
    ) -> Result<QueueStats, Error> {
        let keys = self.keys(queue);
        let (pending, scheduled, processing, done, dead): (i64, i64, i64, i64, i64) =
            redis::Pipeline::with_capacity(5)
                .cmd("ZCARD")
                .arg(&keys.pending)
                .cmd("ZCARD")
                .arg(&keys.scheduled)
                .cmd("ZCARD")
                .arg(&keys.processing)
                .cmd("LLEN")
                .arg(&keys.done)
                .cmd("LLEN")
                .arg(&keys.dead)
                .query_async(conn)
                .await?;

        // Delayed and retry-scheduled jobs both live in the scheduled set;
        // the driver cannot split them, so everything counts as pending and
        // retry_pending reports 0.
        Ok(QueueStats {
            pending: pending + scheduled,
            processing,
            completed: done,
            failed: dead,
            retry_pending: 0,
        })
    }

    /// Pending job ids, best first. Introspection helper.
    pub async fn list_pending(&self, queue: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(queue);
        let members: Vec<String> = conn.zrange(&keys.pending, 0, -1).await?;
        Ok(members
            .iter()
            .map(|m| id_from_member(m).to_string())
            .collect())
    }

    /// Scheduled (delayed or retry-pending) ids with their due times.
    pub async fn list_scheduled(
        &self,
        queue: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(queue);
        let members: Vec<(String, i64)> =
            conn.zrange_withscores(&keys.scheduled, 0, -1).await?;
        Ok(members
            .into_iter()
            .map(|(id, ms)| (id, from_millis(ms)))
            .collect())
    }

    /// Processing ids with their lease expiries.
    pub async fn list_processing(
        &self,
        queue: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(queue);
        let members: Vec<(String, i64)> =
            conn.zrange_withscores(&keys.processing, 0, -1).await?;
        Ok(members
            .into_iter()
            .map(|(id, ms)| (id, from_millis(ms)))
            .collect())
    }

    /// Cumulative counters kept alongside the snapshot stats.
    pub async fn counters(&self, queue: &str) -> Result<HashMap<String, i64>, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(queue);
        Ok(conn.hgetall(&keys.stats).await?)
    }
}

fn schedule_from_hash(
    key: &str,
    map: &HashMap<String, String>,
) -> Result<Option<ScheduleRecord>, Error> {
    if map.is_empty() {
        return Ok(None);
    }
    let get_ms = |field: &str| {
        map.get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_millis)
    };
    let trigger: ScheduleTrigger = map
        .get("trig")
        .map(|raw| serde_json::from_str(raw))
        .transpose()?
        .ok_or_else(|| Error::Validation(format!("schedule {} has no trigger", key)))?;

    Ok(Some(ScheduleRecord {
        key: key.to_string(),
        queue: map.get("q").cloned().unwrap_or_default(),
        trigger,
        payload: map
            .get("pay")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
        limit: map.get("lim").and_then(|v| v.parse::<u32>().ok()),
        end_date: get_ms("end"),
        next_run_at: get_ms("nr"),
        run_count: map
            .get("rc")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0),
        enabled: map.get("en").map(|v| v == "1").unwrap_or(false),
        created_at: get_ms("ct").unwrap_or(DateTime::UNIX_EPOCH),
        updated_at: get_ms("ut").unwrap_or(DateTime::UNIX_EPOCH),
    }))
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::REDIS
    }

    async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueOutcome, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(&req.queue);

        let (stages_json, overall) = if req.stages.is_empty() {
            (None, None)
        } else {
            let set = StageSet::init(req.stages.iter().map(String::as_str));
            (
                Some(serde_json::to_string(&set.stages)?),
                set.overall(),
            )
        };

        let args = EnqueueArgs {
            id: &req.id,
            queue: &req.queue,
            payload: serde_json::to_string(&req.payload)?,
            idempotency_key: req.idempotency_key.as_deref(),
            priority: req.priority,
            scheduled_for: req.scheduled_for,
            max_attempts: req.max_attempts,
            backoff: serde_json::to_string(&req.backoff)?,
            stages: stages_json,
            overall,
            metadata: req
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            replace_if_not_active: req.replace_if_not_active,
        };

        match self
            .enqueue_script
            .run(&mut conn, &keys, &self.job_prefix(), args)
            .await?
        {
            Ok((id, disposition)) => Ok(EnqueueOutcome {
                id,
                disposition,
                scheduled_for: req.scheduled_for,
            }),
            Err(existing_id) => Err(Error::AlreadyActive {
                queue: req.queue,
                key: req.idempotency_key.unwrap_or_default(),
                id: existing_id,
            }),
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        let mut conn = self.pool.get().await?;
        let keys = self.keys(queue);
        let claimed = self
            .claim_script
            .run(
                &mut conn,
                &keys,
                &self.job_prefix(),
                Utc::now(),
                lease.as_millis() as i64,
                worker,
            )
            .await?;

        match claimed {
            Some(id) => self.read_job(&mut conn, &id).await,
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, id: &str, worker: &str, lease: Duration) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let queue: Option<String> = conn
            .hget(self.job_key(id), RedisJobField::Queue)
            .await?;
        let Some(queue) = queue else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        self.heartbeat_script
            .run(
                &mut conn,
                &keys,
                &self.job_prefix(),
                id,
                worker,
                lease.as_millis() as i64,
            )
            .await
    }

    async fn complete(
        &self,
        id: &str,
        worker: &str,
        update: CompletionUpdate,
    ) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let queue: Option<String> = conn
            .hget(self.job_key(id), RedisJobField::Queue)
            .await?;
        let Some(queue) = queue else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        self.complete_script
            .run(
                &mut conn,
                &keys,
                &self.job_prefix(),
                id,
                worker,
                &update,
                self.config.retention.max_per_status,
                self.retention_ttl_ms(true),
            )
            .await
    }

    async fn fail(
        &self,
        id: &str,
        worker: &str,
        report: FailureReport,
    ) -> Result<FailDisposition, Error> {
        let mut conn = self.pool.get().await?;
        let jk = self.job_key(id);
        let (queue, attempts, max_attempts, backoff_raw): (
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(&jk)
            .arg(RedisJobField::Queue)
            .arg(RedisJobField::AttemptsMade)
            .arg(RedisJobField::MaxAttempts)
            .arg(RedisJobField::Backoff)
            .query_async(&mut conn)
            .await?;

        let Some(queue) = queue else {
            return Ok(FailDisposition::NotOwned);
        };
        let attempts = attempts.unwrap_or(0);
        let max_attempts = max_attempts.unwrap_or(1);
        let backoff: RetryPolicy = backoff_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        let now = Utc::now();
        let retryable = report.kind == FailureKind::Retryable && attempts < max_attempts;
        let retry_at = if retryable {
            let delay = backoff.delay_with_jitter(attempts as u32, self.config.jitter_factor);
            Some(crate::util::after(now, delay))
        } else {
            None
        };

        let last_error = serde_json::to_string(&LastError {
            message: report.message.clone(),
            kind: report.kind.as_str().to_string(),
            attempt: attempts as i32,
            at: now,
        })?;

        let keys = self.keys(&queue);
        let outcome = self
            .fail_script
            .run(
                &mut conn,
                &keys,
                &self.job_prefix(),
                id,
                worker,
                &last_error,
                retry_at,
                self.config.retention.max_per_status,
                self.retention_ttl_ms(false),
            )
            .await?;

        Ok(match outcome {
            FailScriptOutcome::NotOwned => FailDisposition::NotOwned,
            FailScriptOutcome::Retry => FailDisposition::RetryPending {
                at: retry_at.unwrap_or(now),
            },
            FailScriptOutcome::Failed => FailDisposition::Failed,
        })
    }

    async fn reschedule(&self, id: &str, worker: &str, delay: Duration) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let queue: Option<String> = conn
            .hget(self.job_key(id), RedisJobField::Queue)
            .await?;
        let Some(queue) = queue else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let at = crate::util::after(Utc::now(), delay);
        self.reschedule_script
            .run(&mut conn, &keys, &self.job_prefix(), id, worker, at)
            .await
    }

    async fn update_progress(
        &self,
        id: &str,
        worker: &str,
        update: ProgressUpdate,
    ) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        self.progress_script
            .run(&mut conn, &self.job_prefix(), id, worker, &update)
            .await
    }

    async fn cancel(&self, job: &JobRef) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let Some((id, queue)) = self.resolve(&mut conn, job).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        self.cancel_script
            .run(&mut conn, &keys, &self.job_prefix(), &id)
            .await
    }

    async fn retry(&self, job: &JobRef) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let Some((id, queue)) = self.resolve(&mut conn, job).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        self.retry_script
            .run(&mut conn, &keys, &self.job_prefix(), &id)
            .await
    }

    async fn get_job(&self, job: &JobRef) -> Result<Option<JobRecord>, Error> {
        let mut conn = self.pool.get().await?;
        let Some((id, _queue)) = self.resolve(&mut conn, job).await? else {
            return Ok(None);
        };
        self.read_job(&mut conn, &id).await
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, Error> {
        let mut conn = self.pool.get().await?;
        match queue {
            Some(queue) => self.stats_for_queue(&mut conn, queue).await,
            None => {
                let queues: Vec<String> = conn.smembers(self.queues_set()).await?;
                let mut total = QueueStats::default();
                for queue in queues {
                    let stats = self.stats_for_queue(&mut conn, &queue).await?;
                    total.pending += stats.pending;
                    total.processing += stats.processing;
                    total.completed += stats.completed;
                    total.failed += stats.failed;
                }
                Ok(total)
            }
        }
    }
}

#[async_trait]
impl ScheduleStore for RedisBackend {
    async fn upsert_schedule(&self, record: &ScheduleRecord) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        let hash = self.schedule_hash(&record.key);
        let now_ms = to_millis(Utc::now());

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&hash).ignore();
        pipe.cmd("HSET")
            .arg(&hash)
            .arg("q")
            .arg(&record.queue)
            .arg("trig")
            .arg(serde_json::to_string(&record.trigger)?)
            .arg("pay")
            .arg(serde_json::to_string(&record.payload)?)
            .arg("rc")
            .arg(record.run_count)
            .arg("en")
            .arg(if record.enabled { "1" } else { "0" })
            .arg("ct")
            .arg(now_ms)
            .arg("ut")
            .arg(now_ms)
            .ignore();
        if let Some(limit) = record.limit {
            pipe.cmd("HSET").arg(&hash).arg("lim").arg(limit).ignore();
        }
        if let Some(end) = record.end_date {
            pipe.cmd("HSET")
                .arg(&hash)
                .arg("end")
                .arg(to_millis(end))
                .ignore();
        }
        match (record.enabled, record.next_run_at) {
            (true, Some(next)) => {
                pipe.cmd("HSET")
                    .arg(&hash)
                    .arg("nr")
                    .arg(to_millis(next))
                    .ignore();
                pipe.cmd("ZADD")
                    .arg(self.schedules_zset())
                    .arg(to_millis(next))
                    .arg(&record.key)
                    .ignore();
            }
            _ => {
                pipe.cmd("ZREM")
                    .arg(self.schedules_zset())
                    .arg(&record.key)
                    .ignore();
            }
        }
        pipe.cmd("SADD")
            .arg(self.schedule_keys_set())
            .arg(&record.key)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let (removed, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.schedule_hash(key))
            .cmd("SREM")
            .arg(self.schedule_keys_set())
            .arg(key)
            .cmd("ZREM")
            .arg(self.schedules_zset())
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<ScheduleRecord>, Error> {
        let mut conn = self.pool.get().await?;
        let map: HashMap<String, String> = conn.hgetall(self.schedule_hash(key)).await?;
        schedule_from_hash(key, &map)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, Error> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.smembers(self.schedule_keys_set()).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(self.schedule_hash(&key)).await?;
            if let Some(record) = schedule_from_hash(&key, &map)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduleRecord>, Error> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.schedules_zset())
            .arg("-inf")
            .arg(to_millis(now))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(self.schedule_hash(&key)).await?;
            if let Some(record) = schedule_from_hash(&key, &map)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn advance_schedule(
        &self,
        key: &str,
        seen_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        self.advance_script
            .run(
                &mut conn,
                &self.schedules_zset(),
                &self.schedule_hash(key),
                key,
                seen_next_run,
                next_run,
                enabled,
            )
            .await
    }

    async fn next_schedule_wake(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let mut conn = self.pool.get().await?;
        let first: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(self.schedules_zset())
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(first.first().map(|(_, ms)| from_millis(*ms)))
    }
}

#[cfg(all(test, feature = "test_redis"))]
mod tests {
    use super::*;
    use crate::contract::EnqueueDisposition;
    use crate::util::new_job_id;
    use futures::FutureExt;
    use std::future::Future;

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

    async fn run_queue_test<T, Fut>(test: T)
    where
        T: Send + Sync + FnOnce(RedisBackend, String) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        dotenv::dotenv().ok();
        let queue_name = format!("test-{}", uuid::Uuid::new_v4());
        let pool = RedisPool::new(None, None).expect("Creating connection pool");
        let cleanup_pool = pool.clone();
        let mut config = QueueConfig::default();
        config.jitter_factor = 0.0;
        config.default_backoff = RetryPolicy::Fixed {
            base: Duration::from_millis(50),
        };
        let backend = RedisBackend::new(pool, config);
        let root = backend.root.clone();

        let result = std::panic::AssertUnwindSafe(test(backend, queue_name.clone()))
            .catch_unwind()
            .await;

        // Clean up the test keys.
        let mut conn = cleanup_pool
            .get()
            .await
            .expect("Cleanup: acquiring connection");
        let patterns = [
            format!("{}:{}:*", root, queue_name),
            format!("{}:job:*", root),
        ];
        for pattern in patterns {
            let mut cursor = 0u64;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .expect("Cleanup: scanning keyspace");
                if !keys.is_empty() {
                    let mut del = redis::cmd("DEL");
                    for key in &keys {
                        del.arg(key);
                    }
                    del.query_async::<_, ()>(&mut conn)
                        .await
                        .expect("Cleanup: deleting keys");
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }

        result.expect("Panicked").expect("Error");
    }

    #[tokio::test]
    async fn enqueue_claim_complete() {
        run_queue_test(|backend, queue| async move {
            let outcome = backend
                .enqueue(test_request(&queue, serde_json::json!({"n": 1})))
                .await?;
            assert_eq!(outcome.disposition, EnqueueDisposition::Inserted);
            assert_eq!(backend.list_pending(&queue).await?, vec![outcome.id.clone()]);

            let job = backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .expect("job should be claimable");
            assert_eq!(job.id, outcome.id);
            assert_eq!(job.attempts_made, 1);
            assert_eq!(job.locked_by.as_deref(), Some("w1"));

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
                .get_job(&JobRef::Id(job.id.clone()))
                .await?
                .expect("terminal record retained");
            assert_eq!(record.status, crate::job::JobStatus::Completed);
            assert_eq!(record.artifacts, Some(serde_json::json!({"ok": true})));

            let stats = backend.stats(Some(&queue)).await?;
            assert_eq!(stats.completed, 1);
            assert_eq!(stats.pending, 0);
            assert!(backend.list_processing(&queue).await?.is_empty());
            assert_eq!(backend.counters(&queue).await?.get("enqueued"), Some(&1));

            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn priority_beats_fifo_across_bands() {
        run_queue_test(|backend, queue| async move {
            let low = backend
                .enqueue(test_request(&queue, serde_json::json!({"n": 1})))
                .await?;
            let mut high_req = test_request(&queue, serde_json::json!({"n": 2}));
            high_req.priority = Some(10);
            let high = backend.enqueue(high_req).await?;

            let first = backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .unwrap();
            assert_eq!(first.id, high.id);
            let second = backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .unwrap();
            assert_eq!(second.id, low.id);
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn rate_limit_reschedule_returns_attempt() {
        run_queue_test(|backend, queue| async move {
            let outcome = backend
                .enqueue(test_request(&queue, serde_json::json!({})))
                .await?;
            let job = backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .unwrap();
            assert_eq!(job.attempts_made, 1);

            let rescheduled = backend
                .reschedule(&job.id, "w1", Duration::from_millis(100))
                .await?;
            assert!(rescheduled);

            let record = backend
                .get_job(&JobRef::Id(outcome.id.clone()))
                .await?
                .unwrap();
            assert_eq!(record.status, crate::job::JobStatus::Pending);
            assert_eq!(record.attempts_made, 0);
            let scheduled = backend.list_scheduled(&queue).await?;
            assert_eq!(scheduled.len(), 1);
            assert_eq!(scheduled[0].0, outcome.id);

            tokio::time::sleep(Duration::from_millis(150)).await;
            let again = backend
                .claim(&queue, "w2", Duration::from_secs(30))
                .await?
                .expect("due again after the rate-limit window");
            assert_eq!(again.attempts_made, 1);
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn idempotent_enqueue_and_replace_semantics() {
        run_queue_test(|backend, queue| async move {
            let mut first = test_request(&queue, serde_json::json!({"v": 1}));
            first.idempotency_key = Some("k1".to_string());
            let first = backend.enqueue(first).await?;

            let mut dup = test_request(&queue, serde_json::json!({"v": 2}));
            dup.idempotency_key = Some("k1".to_string());
            let dup_outcome = backend.enqueue(dup).await?;
            assert_eq!(dup_outcome.id, first.id);
            assert_eq!(dup_outcome.disposition, EnqueueDisposition::ExistingKept);

            let mut replace = test_request(&queue, serde_json::json!({"v": 3}));
            replace.idempotency_key = Some("k1".to_string());
            replace.replace_if_not_active = true;
            let replaced = backend.enqueue(replace).await?;
            assert_eq!(replaced.id, first.id);
            assert_eq!(replaced.disposition, EnqueueDisposition::Replaced);

            backend
                .claim(&queue, "w1", Duration::from_secs(30))
                .await?
                .unwrap();
            let mut conflict = test_request(&queue, serde_json::json!({"v": 4}));
            conflict.idempotency_key = Some("k1".to_string());
            conflict.replace_if_not_active = true;
            let err = backend.enqueue(conflict).await.unwrap_err();
            assert!(matches!(err, Error::AlreadyActive { .. }));

            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn expired_lease_recovery() {
        run_queue_test(|backend, queue| async move {
            let outcome = backend
                .enqueue(test_request(&queue, serde_json::json!({})))
                .await?;
            backend
                .claim(&queue, "w1", Duration::from_millis(100))
                .await?
                .unwrap();

            tokio::time::sleep(Duration::from_millis(150)).await;

            let reclaimed = backend
                .claim(&queue, "w2", Duration::from_secs(30))
                .await?
                .expect("expired lease should be recovered");
            assert_eq!(reclaimed.id, outcome.id);
            assert_eq!(reclaimed.attempts_made, 2);
            assert_eq!(
                reclaimed.last_error.expect("timeout recorded").kind,
                "timeout"
            );
            Ok(())
        })
        .await;
    }
}
