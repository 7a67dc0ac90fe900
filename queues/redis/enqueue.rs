use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::contract::EnqueueDisposition;
use crate::error::Error;
use crate::util::to_millis;

// Insert a job, honoring idempotency keys and the replacement policy.
// KEYS:
//  1. pending zset
//  2. scheduled zset
//  3. idempotency key hash
//  4. stats hash
//  5. known-queues set
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. queue name
//  4. payload json
//  5. idempotency key ('' = none)
//  6. priority ('' = none)
//  7. scheduled-for ms ('' = immediate)
//  8. max attempts
//  9. backoff policy json
// 10. now ms
// 11. stages json ('' = none)
// 12. overall progress ('' = none)
// 13. metadata json ('' = none)
// 14. mode: 'plain' | 'never' | 'replace'
const ENQUEUE_SCRIPT: &str = r##"
    local prefix = ARGV[1]
    local id = ARGV[2]
    local key = ARGV[5]
    local now = tonumber(ARGV[10])
    local mode = ARGV[14]
    local created = now
    local disposition = 'inserted'

    if key ~= '' then
        local existing = redis.call("HGET", KEYS[3], key)
        if existing then
            if mode == 'never' then
                return {existing, 'kept'}
            end
            local ejk = prefix .. existing
            local st = redis.call("HGET", ejk, "st")
            if st == 'processing' then
                return {existing, 'active'}
            end
            -- Drop the old placement; the job is rebuilt in place under its
            -- original id and creation time.
            local ct = tonumber(redis.call("HGET", ejk, "ct")) or now
            redis.call("ZREM", KEYS[1], string.format("%016d:", ct) .. existing)
            redis.call("ZREM", KEYS[2], existing)
            redis.call("DEL", ejk)
            id = existing
            created = ct
            disposition = 'replaced'
        end
    end

    local jk = prefix .. id
    redis.call("HSET", jk,
        "q", ARGV[3],
        "pay", ARGV[4],
        "st", "pending",
        "am", 0,
        "ma", ARGV[8],
        "bo", ARGV[9],
        "ct", created,
        "ut", now)
    if key ~= '' then
        redis.call("HSET", jk, "key", key)
        redis.call("HSET", KEYS[3], key, id)
    end
    if ARGV[6] ~= '' then
        redis.call("HSET", jk, "pri", ARGV[6])
    end
    if ARGV[11] ~= '' then
        redis.call("HSET", jk, "stg", ARGV[11])
    end
    if ARGV[12] ~= '' then
        redis.call("HSET", jk, "ov", ARGV[12])
    end
    if ARGV[13] ~= '' then
        redis.call("HSET", jk, "md", ARGV[13])
    end

    local sched = tonumber(ARGV[7])
    if sched and sched > now then
        redis.call("HSET", jk, "sf", sched)
        redis.call("ZADD", KEYS[2], sched, id)
    else
        if sched then
            redis.call("HSET", jk, "sf", sched)
        end
        local pri = tonumber(ARGV[6]) or 0
        redis.call("ZADD", KEYS[1], -pri, string.format("%016d:", created) .. id)
    end

    redis.call("HINCRBY", KEYS[4], "enqueued", 1)
    redis.call("SADD", KEYS[5], ARGV[3])
    return {id, disposition}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
}

pub(super) struct EnqueueScript(&'static redis::Script);

pub(super) struct EnqueueArgs<'a> {
    pub id: &'a str,
    pub queue: &'a str,
    pub payload: String,
    pub idempotency_key: Option<&'a str>,
    pub priority: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub backoff: String,
    pub stages: Option<String>,
    pub overall: Option<u8>,
    pub metadata: Option<String>,
    pub replace_if_not_active: bool,
}

impl EnqueueScript {
    pub fn new() -> Self {
        EnqueueScript(&SCRIPT)
    }

    /// Returns the effective job id and the disposition; the inner `Err`
    /// carries the existing id for the already-active case.
    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        args: EnqueueArgs<'_>,
    ) -> Result<Result<(String, EnqueueDisposition), String>, Error> {
        let mode = if args.idempotency_key.is_none() {
            "plain"
        } else if args.replace_if_not_active {
            "replace"
        } else {
            "never"
        };

        let (id, disposition): (String, String) = self
            .0
            .key(&keys.pending)
            .key(&keys.scheduled)
            .key(&keys.idempotency)
            .key(&keys.stats)
            .key(&keys.queues_set)
            .arg(job_prefix)
            .arg(args.id)
            .arg(args.queue)
            .arg(&args.payload)
            .arg(args.idempotency_key.unwrap_or(""))
            .arg(args.priority.map(|p| p.to_string()).unwrap_or_default())
            .arg(
                args.scheduled_for
                    .map(|at| to_millis(at).to_string())
                    .unwrap_or_default(),
            )
            .arg(args.max_attempts)
            .arg(&args.backoff)
            .arg(to_millis(Utc::now()))
            .arg(args.stages.as_deref().unwrap_or(""))
            .arg(args.overall.map(|p| p.to_string()).unwrap_or_default())
            .arg(args.metadata.as_deref().unwrap_or(""))
            .arg(mode)
            .invoke_async(conn)
            .await?;

        let disposition = match disposition.as_str() {
            "inserted" => EnqueueDisposition::Inserted,
            "kept" => EnqueueDisposition::ExistingKept,
            "replaced" => EnqueueDisposition::Replaced,
            "active" => return Ok(Err(id)),
            other => {
                return Err(Error::Validation(format!(
                    "unexpected enqueue disposition {}",
                    other
                )))
            }
        };
        Ok(Ok((id, disposition)))
    }
}
