use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::error::Error;
use crate::util::to_millis;

// Advance a schedule past one firing, guarded on the next-run value the
// caller observed. Losing the guard means another scheduler instance owns
// this occurrence.
// KEYS:
//  1. schedules-by-next-run zset
//  2. schedule hash
// ARGS:
//  1. schedule key
//  2. observed next-run ms ('' = none)
//  3. new next-run ms ('' = none)
//  4. enabled after firing: '1' | '0'
//  5. now ms
const ADVANCE_SCRIPT: &str = r##"
    if redis.call("HGET", KEYS[2], "en") ~= '1' then
        return 0
    end
    local seen = redis.call("HGET", KEYS[2], "nr")
    if seen == false then seen = '' end
    if seen ~= ARGV[2] then
        return 0
    end

    redis.call("HINCRBY", KEYS[2], "rc", 1)
    redis.call("HSET", KEYS[2], "en", ARGV[4], "ut", ARGV[5])
    if ARGV[4] == '1' and ARGV[3] ~= '' then
        redis.call("HSET", KEYS[2], "nr", ARGV[3])
        redis.call("ZADD", KEYS[1], tonumber(ARGV[3]), ARGV[1])
    else
        redis.call("HDEL", KEYS[2], "nr")
        redis.call("ZREM", KEYS[1], ARGV[1])
    end
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ADVANCE_SCRIPT);
}

pub(super) struct AdvanceScheduleScript(&'static redis::Script);

impl AdvanceScheduleScript {
    pub fn new() -> Self {
        AdvanceScheduleScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        conn: &mut Connection,
        schedules_zset: &str,
        schedule_hash: &str,
        key: &str,
        seen_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<bool, Error> {
        let advanced: i64 = self
            .0
            .key(schedules_zset)
            .key(schedule_hash)
            .arg(key)
            .arg(
                seen_next_run
                    .map(|at| to_millis(at).to_string())
                    .unwrap_or_default(),
            )
            .arg(
                next_run
                    .map(|at| to_millis(at).to_string())
                    .unwrap_or_default(),
            )
            .arg(if enabled { "1" } else { "0" })
            .arg(to_millis(Utc::now()))
            .invoke_async(conn)
            .await?;
        Ok(advanced == 1)
    }
}
