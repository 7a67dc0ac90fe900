use chrono::Utc;
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use super::QueueKeys;
use crate::error::Error;
use crate::util::to_millis;

// Extend a lease. Succeeds only while the caller still owns the job.
// KEYS:
//  1. processing zset
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. worker id
//  4. now ms
//  5. lease ms
const HEARTBEAT_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    if redis.call("HGET", jk, "lb") ~= ARGV[3] or redis.call("HGET", jk, "st") ~= "processing" then
        return 0
    end
    local exp = tonumber(ARGV[4]) + tonumber(ARGV[5])
    redis.call("ZADD", KEYS[1], exp, ARGV[2])
    redis.call("HSET", jk, "ex", exp, "ut", ARGV[4])
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(HEARTBEAT_SCRIPT);
}

pub(super) struct HeartbeatScript(&'static redis::Script);

impl HeartbeatScript {
    pub fn new() -> Self {
        HeartbeatScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        keys: &QueueKeys,
        job_prefix: &str,
        id: &str,
        worker: &str,
        lease_ms: i64,
    ) -> Result<bool, Error> {
        let extended: i64 = self
            .0
            .key(&keys.processing)
            .arg(job_prefix)
            .arg(id)
            .arg(worker)
            .arg(to_millis(Utc::now()))
            .arg(lease_ms)
            .invoke_async(conn)
            .await?;
        Ok(extended == 1)
    }
}
