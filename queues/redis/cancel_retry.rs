use chrono::Utc;
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::error::Error;
use crate::util::to_millis;

// Cancel a job that has not started: remove it from the pending/scheduled
// placements and drop its record. Processing and terminal jobs are left
// untouched.
// KEYS:
//  1. pending zset
//  2. scheduled zset
//  3. idempotency key hash
// ARGS:
//  1. job data key prefix
//  2. job id
const CANCEL_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    local st = redis.call("HGET", jk, "st")
    if st ~= 'pending' and st ~= 'retry_pending' then
        return 0
    end
    local ct = tonumber(redis.call("HGET", jk, "ct")) or 0
    redis.call("ZREM", KEYS[1], string.format("%016d:", ct) .. ARGV[2])
    redis.call("ZREM", KEYS[2], ARGV[2])
    local key = redis.call("HGET", jk, "key")
    if key then
        redis.call("HDEL", KEYS[3], key)
    end
    redis.call("DEL", jk)
    return 1
"##;

// Re-run a failed job now. Attempts are preserved; the cap moves up so the
// retried run is not immediately exhausted.
// KEYS:
//  1. pending zset
//  2. dead list
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. now ms
const RETRY_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    if redis.call("HGET", jk, "st") ~= 'failed' then
        return 0
    end
    local now = tonumber(ARGV[3])
    local am = tonumber(redis.call("HGET", jk, "am")) or 0
    local ma = tonumber(redis.call("HGET", jk, "ma")) or 1
    if am + 1 > ma then
        ma = am + 1
    end
    local ct = tonumber(redis.call("HGET", jk, "ct")) or now
    local pri = tonumber(redis.call("HGET", jk, "pri")) or 0
    redis.call("HSET", jk, "st", "pending", "sf", now, "ma", ma, "ut", now)
    redis.call("HDEL", jk, "ea")
    redis.call("PERSIST", jk)
    redis.call("LREM", KEYS[2], 1, ARGV[2])
    redis.call("ZADD", KEYS[1], -pri, string.format("%016d:", ct) .. ARGV[2])
    return 1
"##;

lazy_static! {
    static ref CANCEL: redis::Script = redis::Script::new(CANCEL_SCRIPT);
    static ref RETRY: redis::Script = redis::Script::new(RETRY_SCRIPT);
}

pub(super) struct CancelScript(&'static redis::Script);

impl CancelScript {
    pub fn new() -> Self {
        CancelScript(&CANCEL)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
    ) -> Result<bool, Error> {
        let cancelled: i64 = self
            .0
            .key(&keys.pending)
            .key(&keys.scheduled)
            .key(&keys.idempotency)
            .arg(job_prefix)
            .arg(id)
            .invoke_async(conn)
            .await?;
        Ok(cancelled == 1)
    }
}

pub(super) struct RetryScript(&'static redis::Script);

impl RetryScript {
    pub fn new() -> Self {
        RetryScript(&RETRY)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
    ) -> Result<bool, Error> {
        let retried: i64 = self
            .0
            .key(&keys.pending)
            .key(&keys.dead)
            .arg(job_prefix)
            .arg(id)
            .arg(to_millis(Utc::now()))
            .invoke_async(conn)
            .await?;
        Ok(retried == 1)
    }
}
