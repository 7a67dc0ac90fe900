use chrono::Utc;
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::contract::CompletionUpdate;
use crate::error::Error;
use crate::util::to_millis;

// Mark a job completed. Only the lease holder may do this. Retention is
// applied inline: the done list is trimmed to the cap (dropping trimmed job
// hashes) and the job hash gets a TTL when an age policy is set.
// KEYS:
//  1. processing zset
//  2. stats hash
//  3. done list
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. worker id
//  4. now ms
//  5. artifacts json ('' = leave)
//  6. stages json ('' = leave)
//  7. current stage ('' = leave)
//  8. overall progress ('' = leave)
//  9. per-status row cap ('' = none)
// 10. retention ttl ms ('' = none)
const COMPLETE_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    local now = tonumber(ARGV[4])
    if redis.call("HGET", jk, "lb") ~= ARGV[3] or redis.call("HGET", jk, "st") ~= "processing" then
        return 0
    end

    redis.call("ZREM", KEYS[1], ARGV[2])
    redis.call("HSET", jk, "st", "completed", "ea", now, "ut", now)
    redis.call("HDEL", jk, "lb", "la", "ex")
    if ARGV[5] ~= '' then redis.call("HSET", jk, "art", ARGV[5]) end
    if ARGV[6] ~= '' then redis.call("HSET", jk, "stg", ARGV[6]) end
    if ARGV[7] ~= '' then redis.call("HSET", jk, "cur", ARGV[7]) end
    if ARGV[8] ~= '' then redis.call("HSET", jk, "ov", ARGV[8]) end

    redis.call("HINCRBY", KEYS[2], "completed", 1)
    redis.call("LPUSH", KEYS[3], ARGV[2])
    if ARGV[9] ~= '' then
        local cap = tonumber(ARGV[9])
        while redis.call("LLEN", KEYS[3]) > cap do
            local old = redis.call("RPOP", KEYS[3])
            if old then
                redis.call("DEL", ARGV[1] .. old)
            else
                break
            end
        end
    end
    if ARGV[10] ~= '' then
        redis.call("PEXPIRE", jk, tonumber(ARGV[10]))
    end
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(COMPLETE_SCRIPT);
}

pub(super) struct CompleteScript(&'static redis::Script);

impl CompleteScript {
    pub fn new() -> Self {
        CompleteScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
        worker: &str,
        update: &CompletionUpdate,
        row_cap: Option<u32>,
        ttl_ms: Option<i64>,
    ) -> Result<bool, Error> {
        let artifacts = update
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let stages = update
            .stages
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated: i64 = self
            .0
            .key(&keys.processing)
            .key(&keys.stats)
            .key(&keys.done)
            .arg(job_prefix)
            .arg(id)
            .arg(worker)
            .arg(to_millis(Utc::now()))
            .arg(artifacts.as_deref().unwrap_or(""))
            .arg(stages.as_deref().unwrap_or(""))
            .arg(update.current_stage.as_deref().unwrap_or(""))
            .arg(
                update
                    .overall_progress
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            )
            .arg(row_cap.map(|c| c.to_string()).unwrap_or_default())
            .arg(ttl_ms.map(|t| t.to_string()).unwrap_or_default())
            .invoke_async(conn)
            .await?;
        Ok(updated == 1)
    }
}
