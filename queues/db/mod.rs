//! SQL-backed drivers. PostgreSQL claims with `FOR UPDATE SKIP LOCKED`;
//! SQLite serializes writes through a single-connection pool and claims with
//! a guarded UPDATE. Both store jobs in `queue_jobs` and schedules in
//! `queue_schedules`.

mod listener;
mod postgres;
mod schema;
mod sqlite;

pub use listener::spawn_notify_bridge;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};

pub use crate::contract::RetentionReport;
use crate::error::Error;
use crate::job::LastError;

pub(crate) fn lease_timeout_error(attempt: i32, lease_ms: u64, now: DateTime<Utc>) -> LastError {
    LastError {
        message: format!("lease expired after {}ms", lease_ms),
        kind: "timeout".to_string(),
        attempt,
        at: now,
    }
}

pub(crate) fn failure_error(
    message: &str,
    kind: &str,
    attempt: i32,
    now: DateTime<Utc>,
) -> LastError {
    LastError {
        message: message.to_string(),
        kind: kind.to_string(),
        attempt,
        at: now,
    }
}

pub(crate) fn to_json_string<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn parse_json_opt<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
) -> Result<Option<T>, Error> {
    match raw {
        Some(s) if !s.is_empty() => Ok(Some(serde_json::from_str(&s)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_shape() {
        let now = Utc::now();
        let err = lease_timeout_error(2, 900_000, now);
        assert_eq!(err.kind, "timeout");
        assert_eq!(err.attempt, 2);
        assert!(err.message.contains("900000ms"));
    }

    #[test]
    fn json_opt_round_trip() {
        let parsed: Option<Vec<u32>> =
            parse_json_opt(Some("[1,2,3]".to_string())).unwrap();
        assert_eq!(parsed, Some(vec![1, 2, 3]));
        let empty: Option<Vec<u32>> = parse_json_opt(None).unwrap();
        assert_eq!(empty, None);
    }
}
