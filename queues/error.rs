use std::time::Duration;

use thiserror::Error;

use crate::job::JobRef;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient failure reported by a handler; consumes an attempt and is
    /// retried with backoff.
    #[error("Retryable job failure: {0}")]
    Retryable(anyhow::Error),

    /// The handler determined the job can never succeed.
    #[error("Permanent job failure: {0}")]
    Permanent(anyhow::Error),

    /// Backpressure from a downstream dependency. The job is released back
    /// to the queue without consuming an attempt.
    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// Produced by the runtime when a worker held a lease past its expiry.
    /// Handlers never raise this themselves.
    #[error("Lease on job {job_id} expired after {lease:?}")]
    LeaseExpired { job_id: String, lease: Duration },

    #[error("Job not found: {0}")]
    NotFound(JobRef),

    /// Replace-if-not-active collided with a job that is currently running.
    #[error("Job for key {key} on queue {queue} is already active as {id}")]
    AlreadyActive {
        queue: String,
        key: String,
        id: String,
    },

    /// The storage backend is unreachable. Worker loops treat this as
    /// transient and back off before retrying.
    #[error("Lost connection to queue backend: {0}")]
    ConnectionLost(anyhow::Error),

    #[error("Invalid cron expression {0}: {1}")]
    InvalidCron(String, String),

    #[error("Invalid queue input: {0}")]
    Validation(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("SQL Error")]
    SqlError(#[from] sqlx::error::Error),

    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    DatabaseError(#[from] relay_database::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl Error {
    /// Whether a worker loop should treat this as a transient infrastructure
    /// failure (sleep with backoff, then resume) rather than a job outcome.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_)
                | Error::SqlError(_)
                | Error::RedisError(_)
                | Error::DatabaseError(_)
        )
    }
}

/// Typed outcome for job handlers. Returning an error variant replaces
/// throw-as-control-flow: the worker maps each variant onto the matching
/// queue transition.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(#[source] anyhow::Error),

    #[error("{0}")]
    Permanent(#[source] anyhow::Error),

    #[error("rate limited, retry in {0:?}")]
    RateLimit(Duration),
}

impl HandlerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Permanent(err.into())
    }

    pub fn rate_limit(retry_after: Duration) -> Self {
        HandlerError::RateLimit(retry_after)
    }
}

/// Bare errors from handler internals default to the retryable path.
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Retryable(err)
    }
}

/// Queue-runtime errors surfaced through `JobContext` default to the
/// retryable path, same as bare `anyhow::Error`.
impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        HandlerError::Retryable(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_defaults_to_retryable() {
        let err: HandlerError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, HandlerError::Retryable(_)));
    }

    #[test]
    fn connection_classification() {
        assert!(Error::ConnectionLost(anyhow::anyhow!("down")).is_connection());
        assert!(!Error::Validation("bad".into()).is_connection());
        assert!(!Error::NotFound(JobRef::Id("j".into())).is_connection());
    }
}
