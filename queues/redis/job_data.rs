use std::collections::HashMap;

use crate::backoff::RetryPolicy;
use crate::error::Error;
use crate::job::{JobRecord, JobStatus};
use crate::util::from_millis;

/// Short hash field names for the per-job data key.
#[derive(Clone, Copy)]
pub(super) enum RedisJobField {
    Queue,
    Payload,
    IdempotencyKey,
    Status,
    Priority,
    AttemptsMade,
    MaxAttempts,
    Backoff,
    ScheduledFor,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    EndedAt,
    LockedBy,
    LockedAt,
    ExpiresAt,
    LastError,
    Stages,
    CurrentStage,
    OverallProgress,
    Metadata,
    Artifacts,
}

impl RedisJobField {
    pub(super) const fn as_str(&self) -> &'static str {
        match self {
            RedisJobField::Queue => "q",
            RedisJobField::Payload => "pay",
            RedisJobField::IdempotencyKey => "key",
            RedisJobField::Status => "st",
            RedisJobField::Priority => "pri",
            RedisJobField::AttemptsMade => "am",
            RedisJobField::MaxAttempts => "ma",
            RedisJobField::Backoff => "bo",
            RedisJobField::ScheduledFor => "sf",
            RedisJobField::CreatedAt => "ct",
            RedisJobField::UpdatedAt => "ut",
            RedisJobField::StartedAt => "sa",
            RedisJobField::EndedAt => "ea",
            RedisJobField::LockedBy => "lb",
            RedisJobField::LockedAt => "la",
            RedisJobField::ExpiresAt => "ex",
            RedisJobField::LastError => "err",
            RedisJobField::Stages => "stg",
            RedisJobField::CurrentStage => "cur",
            RedisJobField::OverallProgress => "ov",
            RedisJobField::Metadata => "md",
            RedisJobField::Artifacts => "art",
        }
    }
}

impl redis::ToRedisArgs for RedisJobField {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg(self.as_str().as_bytes())
    }
}

/// The pending ZSET member encodes creation time ahead of the id so that
/// members with equal score (equal priority) pop oldest-first.
pub(super) fn pending_member(created_ms: i64, id: &str) -> String {
    format!("{:016}:{}", created_ms, id)
}

pub(super) fn id_from_member(member: &str) -> &str {
    match member.split_once(':') {
        Some((_, id)) => id,
        None => member,
    }
}

fn get_i64(map: &HashMap<String, String>, field: RedisJobField) -> Option<i64> {
    map.get(field.as_str()).and_then(|v| v.parse::<i64>().ok())
}

fn get_json<T: serde::de::DeserializeOwned>(
    map: &HashMap<String, String>,
    field: RedisJobField,
) -> Result<Option<T>, Error> {
    match map.get(field.as_str()) {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(raw)?)),
        _ => Ok(None),
    }
}

/// Rebuild a `JobRecord` from a HGETALL of the job data key. An empty hash
/// means the job does not exist (or was pruned).
pub(super) fn record_from_hash(
    id: &str,
    map: &HashMap<String, String>,
) -> Result<Option<JobRecord>, Error> {
    if map.is_empty() {
        return Ok(None);
    }

    let status_raw = map
        .get(RedisJobField::Status.as_str())
        .cloned()
        .unwrap_or_default();
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| Error::Validation(format!("unknown job status {}", status_raw)))?;

    let backoff: RetryPolicy =
        get_json(map, RedisJobField::Backoff)?.unwrap_or_default();

    Ok(Some(JobRecord {
        id: id.to_string(),
        queue: map
            .get(RedisJobField::Queue.as_str())
            .cloned()
            .unwrap_or_default(),
        idempotency_key: map.get(RedisJobField::IdempotencyKey.as_str()).cloned(),
        payload: get_json(map, RedisJobField::Payload)?.unwrap_or(serde_json::Value::Null),
        status,
        priority: get_i64(map, RedisJobField::Priority).map(|p| p as i32),
        attempts_made: get_i64(map, RedisJobField::AttemptsMade).unwrap_or(0) as i32,
        max_attempts: get_i64(map, RedisJobField::MaxAttempts).unwrap_or(1) as i32,
        backoff,
        scheduled_for: get_i64(map, RedisJobField::ScheduledFor).map(from_millis),
        created_at: from_millis(get_i64(map, RedisJobField::CreatedAt).unwrap_or(0)),
        updated_at: from_millis(
            get_i64(map, RedisJobField::UpdatedAt)
                .or_else(|| get_i64(map, RedisJobField::CreatedAt))
                .unwrap_or(0),
        ),
        started_at: get_i64(map, RedisJobField::StartedAt).map(from_millis),
        ended_at: get_i64(map, RedisJobField::EndedAt).map(from_millis),
        locked_by: map.get(RedisJobField::LockedBy.as_str()).cloned(),
        locked_at: get_i64(map, RedisJobField::LockedAt).map(from_millis),
        expires_at: get_i64(map, RedisJobField::ExpiresAt).map(from_millis),
        last_error: get_json(map, RedisJobField::LastError)?,
        stages: get_json(map, RedisJobField::Stages)?.unwrap_or_default(),
        current_stage: map.get(RedisJobField::CurrentStage.as_str()).cloned(),
        overall_progress: get_i64(map, RedisJobField::OverallProgress).map(|p| p as u8),
        metadata: get_json(map, RedisJobField::Metadata)?,
        artifacts: get_json(map, RedisJobField::Artifacts)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_encoding_orders_fifo_within_priority() {
        let earlier = pending_member(1_700_000_000_000, "b-job");
        let later = pending_member(1_700_000_000_001, "a-job");
        assert!(earlier < later, "earlier creation sorts first regardless of id");
        assert_eq!(id_from_member(&earlier), "b-job");
        assert_eq!(id_from_member("no-timestamp"), "no-timestamp");
    }

    #[test]
    fn record_from_empty_hash_is_none() {
        let map = HashMap::new();
        assert!(record_from_hash("x", &map).unwrap().is_none());
    }

    #[test]
    fn record_from_minimal_hash() {
        let mut map = HashMap::new();
        map.insert("q".to_string(), "email".to_string());
        map.insert("pay".to_string(), r##"{"to":"a@b"}"##.to_string());
        map.insert("st".to_string(), "pending".to_string());
        map.insert("am".to_string(), "0".to_string());
        map.insert("ma".to_string(), "3".to_string());
        map.insert("ct".to_string(), "1700000000000".to_string());

        let record = record_from_hash("j1", &map).unwrap().unwrap();
        assert_eq!(record.id, "j1");
        assert_eq!(record.queue, "email");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.payload, serde_json::json!({"to": "a@b"}));
        assert_eq!(record.max_attempts, 3);
        assert_eq!(record.updated_at, record.created_at);
    }
}
