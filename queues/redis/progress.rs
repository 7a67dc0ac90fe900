use chrono::Utc;
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::contract::ProgressUpdate;
use crate::error::Error;
use crate::util::to_millis;

// Persist stage/progress state mid-flight, gated on the caller still
// holding the lease.
// ARGS:
//  1. job data key prefix
//  2. job id
//  3. worker id
//  4. now ms
//  5. stages json ('' = leave)
//  6. current stage ('' = leave)
//  7. overall progress ('' = leave)
//  8. artifacts json ('' = leave)
const PROGRESS_SCRIPT: &str = r##"
    local jk = ARGV[1] .. ARGV[2]
    if redis.call("HGET", jk, "lb") ~= ARGV[3] or redis.call("HGET", jk, "st") ~= "processing" then
        return 0
    end
    if ARGV[5] ~= '' then redis.call("HSET", jk, "stg", ARGV[5]) end
    if ARGV[6] ~= '' then redis.call("HSET", jk, "cur", ARGV[6]) end
    if ARGV[7] ~= '' then redis.call("HSET", jk, "ov", ARGV[7]) end
    if ARGV[8] ~= '' then redis.call("HSET", jk, "art", ARGV[8]) end
    redis.call("HSET", jk, "ut", ARGV[4])
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(PROGRESS_SCRIPT);
}

pub(super) struct ProgressScript(&'static redis::Script);

impl ProgressScript {
    pub fn new() -> Self {
        ProgressScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        job_prefix: &str,
        id: &str,
        worker: &str,
        update: &ProgressUpdate,
    ) -> Result<bool, Error> {
        let stages = update
            .stages
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let artifacts = update
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated: i64 = self
            .0
            .prepare_invoke()
            .arg(job_prefix)
            .arg(id)
            .arg(worker)
            .arg(to_millis(Utc::now()))
            .arg(stages.as_deref().unwrap_or(""))
            .arg(update.current_stage.as_deref().unwrap_or(""))
            .arg(
                update
                    .overall_progress
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            )
            .arg(artifacts.as_deref().unwrap_or(""))
            .invoke_async(conn)
            .await?;
        Ok(updated == 1)
    }
}
