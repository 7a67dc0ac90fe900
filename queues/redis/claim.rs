use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::error::Error;
use crate::util::to_millis;

// Claim one job: expired-lease recovery first, then promotion of due
// scheduled jobs, then the best pending member (highest priority, oldest
// first). Attempts increment at claim on every path.
// KEYS:
//  1. pending zset
//  2. scheduled zset
//  3. processing zset
//  4. stats hash
//  5. dead list (exhausted expired jobs)
// ARGS:
//  1. job data key prefix
//  2. now ms
//  3. lease ms
//  4. worker id
//  5. lease-timeout error template (string.format with the attempt count)
const CLAIM_SCRIPT: &str = r##"
    local prefix = ARGV[1]
    local now = tonumber(ARGV[2])
    local lease = tonumber(ARGV[3])
    local worker = ARGV[4]

    -- 1. A processing job whose lease ran out is recovered ahead of fresh
    -- work; one with no attempts left is lazily failed instead.
    local expired = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", now, "LIMIT", 0, 1)
    if expired[1] then
        local id = expired[1]
        local jk = prefix .. id
        local vals = redis.call("HMGET", jk, "am", "ma")
        local am = tonumber(vals[1]) or 0
        local ma = tonumber(vals[2]) or 1
        redis.call("ZREM", KEYS[3], id)
        if am >= ma then
            redis.call("HSET", jk, "st", "failed", "ea", now, "ut", now,
                "err", string.format(ARGV[5], am))
            redis.call("HDEL", jk, "lb", "la", "ex")
            redis.call("HINCRBY", KEYS[4], "failed", 1)
            redis.call("LPUSH", KEYS[5], id)
            -- Fall through to fresh work below.
        else
            local exp = now + lease
            redis.call("ZADD", KEYS[3], exp, id)
            redis.call("HSET", jk, "st", "processing", "lb", worker, "la", now,
                "ex", exp, "ut", now, "am", am + 1,
                "err", string.format(ARGV[5], am))
            if not redis.call("HGET", jk, "sa") then
                redis.call("HSET", jk, "sa", now)
            end
            redis.call("HINCRBY", KEYS[4], "claimed", 1)
            return id
        end
    end

    -- 2. Promote everything scheduled that has come due.
    local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", now, "LIMIT", 0, 100)
    for i, id in ipairs(due) do
        local jk = prefix .. id
        local vals = redis.call("HMGET", jk, "pri", "ct")
        local pri = tonumber(vals[1]) or 0
        local ct = tonumber(vals[2]) or now
        redis.call("ZADD", KEYS[1], -pri, string.format("%016d:", ct) .. id)
        redis.call("ZREM", KEYS[2], id)
    end

    -- 3. Pop the best pending member.
    local popped = redis.call("ZPOPMIN", KEYS[1])
    if popped[1] == nil then
        return false
    end
    local id = string.sub(popped[1], 18)
    local jk = prefix .. id
    local am = tonumber(redis.call("HGET", jk, "am")) or 0
    local exp = now + lease
    redis.call("ZADD", KEYS[3], exp, id)
    redis.call("HSET", jk, "st", "processing", "lb", worker, "la", now,
        "ex", exp, "ut", now, "am", am + 1)
    if not redis.call("HGET", jk, "sa") then
        redis.call("HSET", jk, "sa", now)
    end
    redis.call("HINCRBY", KEYS[4], "claimed", 1)
    return id
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(CLAIM_SCRIPT);
}

pub(super) struct ClaimScript(&'static redis::Script);

impl ClaimScript {
    pub fn new() -> Self {
        ClaimScript(&SCRIPT)
    }

    /// Returns the claimed job id, if any. The caller reads the full record
    /// afterwards; ownership is already established here.
    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        now: DateTime<Utc>,
        lease_ms: i64,
        worker: &str,
    ) -> Result<Option<String>, Error> {
        let error_template = serde_json::json!({
            "message": format!("lease expired after {}ms", lease_ms),
            "kind": "timeout",
            "attempt": "%ATTEMPT%",
            "at": now.to_rfc3339(),
        })
        .to_string()
        .replace("\"%ATTEMPT%\"", "%d");

        let claimed: Option<String> = self
            .0
            .key(&keys.pending)
            .key(&keys.scheduled)
            .key(&keys.processing)
            .key(&keys.stats)
            .key(&keys.dead)
            .arg(job_prefix)
            .arg(to_millis(now))
            .arg(lease_ms)
            .arg(worker)
            .arg(&error_template)
            .invoke_async(conn)
            .await?;
        Ok(claimed)
    }
}
