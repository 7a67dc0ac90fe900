use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::error::Error;
use crate::util::to_millis;

// Rate-limit release: hand the job back to the queue at a future time and
// return the attempt that was charged at claim.
// KEYS:
//  1. processing zset
//  2. scheduled zset
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. worker id
//  4. now ms
//  5. run-at ms
const RESCHEDULE_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    if redis.call("HGET", jk, "lb") ~= ARGV[3] or redis.call("HGET", jk, "st") ~= "processing" then
        return 0
    end
    local at = tonumber(ARGV[5])
    redis.call("ZREM", KEYS[1], ARGV[2])
    redis.call("ZADD", KEYS[2], at, ARGV[2])
    local am = tonumber(redis.call("HGET", jk, "am")) or 0
    if am > 0 then
        am = am - 1
    end
    redis.call("HSET", jk, "st", "pending", "sf", at, "am", am, "ut", ARGV[4])
    redis.call("HDEL", jk, "lb", "la", "ex")
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RESCHEDULE_SCRIPT);
}

pub(super) struct RescheduleScript(&'static redis::Script);

impl RescheduleScript {
    pub fn new() -> Self {
        RescheduleScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
        worker: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let rescheduled: i64 = self
            .0
            .key(&keys.processing)
            .key(&keys.scheduled)
            .arg(job_prefix)
            .arg(id)
            .arg(worker)
            .arg(to_millis(Utc::now()))
            .arg(to_millis(at))
            .invoke_async(conn)
            .await?;
        Ok(rescheduled == 1)
    }
}
