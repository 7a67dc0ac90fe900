use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::error::Error;
use crate::util::to_millis;

// Record a handler failure. The retry decision (and the backoff delay) is
// made by the caller from the job's stored policy; the script only verifies
// ownership and applies the transition atomically.
// KEYS:
//  1. processing zset
//  2. scheduled zset
//  3. stats hash
//  4. dead list
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. worker id
//  4. now ms
//  5. last-error json
//  6. retry: '1' schedules another attempt, '0' fails terminally
//  7. next attempt at ms (when retrying)
//  8. per-status row cap ('' = none)
//  9. retention ttl ms ('' = none)
const FAIL_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    local now = tonumber(ARGV[4])
    if redis.call("HGET", jk, "lb") ~= ARGV[3] or redis.call("HGET", jk, "st") ~= "processing" then
        return 'notowned'
    end

    redis.call("ZREM", KEYS[1], ARGV[2])
    redis.call("HDEL", jk, "lb", "la", "ex")

    if ARGV[6] == '1' then
        local at = tonumber(ARGV[7])
        redis.call("HSET", jk, "st", "retry_pending", "sf", at, "err", ARGV[5], "ut", now)
        redis.call("ZADD", KEYS[2], at, ARGV[2])
        return 'retry'
    end

    redis.call("HSET", jk, "st", "failed", "ea", now, "err", ARGV[5], "ut", now)
    redis.call("HINCRBY", KEYS[3], "failed", 1)
    redis.call("LPUSH", KEYS[4], ARGV[2])
    if ARGV[8] ~= '' then
        local cap = tonumber(ARGV[8])
        while redis.call("LLEN", KEYS[4]) > cap do
            local old = redis.call("RPOP", KEYS[4])
            if old then
                redis.call("DEL", ARGV[1] .. old)
            else
                break
            end
        end
    end
    if ARGV[9] ~= '' then
        redis.call("PEXPIRE", jk, tonumber(ARGV[9]))
    end
    return 'failed'
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(FAIL_SCRIPT);
}

pub(super) enum FailScriptOutcome {
    NotOwned,
    Retry,
    Failed,
}

pub(super) struct FailScript(&'static redis::Script);

impl FailScript {
    pub fn new() -> Self {
        FailScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
        worker: &str,
        error_json: &str,
        retry_at: Option<DateTime<Utc>>,
        row_cap: Option<u32>,
        ttl_ms: Option<i64>,
    ) -> Result<FailScriptOutcome, Error> {
        let outcome: String = self
            .0
            .key(&keys.processing)
            .key(&keys.scheduled)
            .key(&keys.stats)
            .key(&keys.dead)
            .arg(job_prefix)
            .arg(id)
            .arg(worker)
            .arg(to_millis(Utc::now()))
            .arg(error_json)
            .arg(if retry_at.is_some() { "1" } else { "0" })
            .arg(retry_at.map(|at| to_millis(at).to_string()).unwrap_or_default())
            .arg(row_cap.map(|c| c.to_string()).unwrap_or_default())
            .arg(ttl_ms.map(|t| t.to_string()).unwrap_or_default())
            .invoke_async(conn)
            .await?;

        match outcome.as_str() {
            "notowned" => Ok(FailScriptOutcome::NotOwned),
            "retry" => Ok(FailScriptOutcome::Retry),
            "failed" => Ok(FailScriptOutcome::Failed),
            other => Err(Error::Validation(format!(
                "unexpected fail outcome {}",
                other
            ))),
        }
    }
}
