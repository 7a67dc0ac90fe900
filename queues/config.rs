use std::env;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::error::Error;

/// Tunables recognized by the queue core. Field-level environment overrides
/// are applied by `QueueConfig::from_env`; everything has a sensible
/// default so embedded use needs no configuration at all.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim holds a job before it can be reclaimed.
    pub lease_duration: Duration,
    /// Interval between lease extensions. Clamped below lease/2 at use.
    pub heartbeat_interval: Duration,
    pub default_max_attempts: i32,
    pub default_backoff: RetryPolicy,
    pub jitter_factor: f64,
    /// Idle claim-loop sleep for backends without push notification.
    pub poll_interval: Duration,
    pub graceful_shutdown: Duration,
    pub wait_timeout_min: Duration,
    pub wait_timeout_max: Duration,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionConfig {
    /// Remove completed jobs older than this.
    pub completed_after: Option<Duration>,
    /// Remove failed jobs older than this.
    pub failed_after: Option<Duration>,
    /// Keep at most this many rows per terminal status.
    pub max_per_status: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            lease_duration: Duration::from_millis(900_000),
            heartbeat_interval: Duration::from_millis(60_000),
            default_max_attempts: 3,
            default_backoff: RetryPolicy::default(),
            jitter_factor: 0.1,
            poll_interval: Duration::from_millis(500),
            graceful_shutdown: Duration::from_millis(30_000),
            wait_timeout_min: Duration::from_millis(1_000),
            wait_timeout_max: Duration::from_millis(60_000),
            retention: RetentionConfig::default(),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl QueueConfig {
    pub fn from_env() -> QueueConfig {
        let mut config = QueueConfig::default();
        if let Some(v) = env_millis("QUEUE_LEASE_MS") {
            config.lease_duration = v;
        }
        if let Some(v) = env_millis("QUEUE_HEARTBEAT_MS") {
            config.heartbeat_interval = v;
        }
        if let Ok(v) = env::var("QUEUE_MAX_ATTEMPTS") {
            if let Ok(v) = v.parse() {
                config.default_max_attempts = v;
            }
        }
        if let Some(v) = env_millis("QUEUE_POLL_MS") {
            // The claim loop floor and ceiling keep a misconfigured poller
            // from either hammering the database or going to sleep.
            config.poll_interval = v.clamp(Duration::from_millis(200), Duration::from_millis(1000));
        }
        if let Some(v) = env_millis("QUEUE_SHUTDOWN_GRACE_MS") {
            config.graceful_shutdown = v;
        }
        if let Some(v) = env_millis("QUEUE_RETAIN_COMPLETED_MS") {
            config.retention.completed_after = Some(v);
        }
        if let Some(v) = env_millis("QUEUE_RETAIN_FAILED_MS") {
            config.retention.failed_after = Some(v);
        }
        if let Ok(v) = env::var("QUEUE_RETAIN_MAX_PER_STATUS") {
            if let Ok(v) = v.parse() {
                config.retention.max_per_status = Some(v);
            }
        }
        config
    }

    /// Heartbeat interval actually used: always under half the lease so two
    /// missed beats still leave slack before expiry.
    pub fn effective_heartbeat(&self) -> Duration {
        let half_lease = self.lease_duration / 2;
        if self.heartbeat_interval >= half_lease {
            half_lease.max(Duration::from_millis(100))
        } else {
            self.heartbeat_interval
        }
    }

    /// Clamp an HTTP wait timeout into the configured band.
    pub fn clamp_wait_timeout(&self, requested: Duration) -> Duration {
        requested.clamp(self.wait_timeout_min, self.wait_timeout_max)
    }
}

/// Which storage backend to run against, fixed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelector {
    Redis { url: Option<String>, key_prefix: Option<String> },
    Postgres { url: String },
    Sqlite { url: String },
}

impl BackendSelector {
    /// Read `QUEUE_BACKEND` plus the matching connection variables.
    pub fn from_env() -> Result<BackendSelector, Error> {
        let backend = env::var("QUEUE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());
        match backend.as_str() {
            "redis" => Ok(BackendSelector::Redis {
                url: env::var("REDIS_URL").ok(),
                key_prefix: env::var("QUEUE_REDIS_PREFIX").ok(),
            }),
            "postgres" => {
                let url = env::var("DATABASE_URL").map_err(|_| {
                    Error::Validation("DATABASE_URL is required for the postgres backend".into())
                })?;
                Ok(BackendSelector::Postgres { url })
            }
            "sqlite" => {
                let url = env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://relay-queue.db".to_string());
                Ok(BackendSelector::Sqlite { url })
            }
            other => Err(Error::Validation(format!(
                "unknown QUEUE_BACKEND {}; expected redis, postgres or sqlite",
                other
            ))),
        }
    }
}

/// What a process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Api,
    Worker,
    All,
}

impl ServiceRole {
    pub fn from_env() -> Result<ServiceRole, Error> {
        match env::var("SERVICE_ROLE").as_deref() {
            Ok("api") => Ok(ServiceRole::Api),
            Ok("worker") => Ok(ServiceRole::Worker),
            Ok("all") | Err(_) => Ok(ServiceRole::All),
            Ok(other) => Err(Error::Validation(format!(
                "unknown SERVICE_ROLE {}; expected api, worker or all",
                other
            ))),
        }
    }

    pub fn serves_http(&self) -> bool {
        matches!(self, ServiceRole::Api | ServiceRole::All)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, ServiceRole::Worker | ServiceRole::All)
    }
}

/// Queue name with an optional deployment prefix, for installations that
/// share one storage substrate.
pub fn prefixed_queue(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{}-{}", p, name),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = QueueConfig::default();
        assert_eq!(config.lease_duration, Duration::from_millis(900_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(60_000));
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.graceful_shutdown, Duration::from_millis(30_000));
    }

    #[test]
    fn heartbeat_clamps_below_half_lease() {
        let mut config = QueueConfig::default();
        config.lease_duration = Duration::from_secs(10);
        config.heartbeat_interval = Duration::from_secs(60);
        assert_eq!(config.effective_heartbeat(), Duration::from_secs(5));

        config.heartbeat_interval = Duration::from_secs(2);
        assert_eq!(config.effective_heartbeat(), Duration::from_secs(2));
    }

    #[test]
    fn wait_timeout_clamps_to_band() {
        let config = QueueConfig::default();
        assert_eq!(
            config.clamp_wait_timeout(Duration::from_millis(10)),
            Duration::from_millis(1000)
        );
        assert_eq!(
            config.clamp_wait_timeout(Duration::from_secs(120)),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.clamp_wait_timeout(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn prefixed_queue_names() {
        assert_eq!(prefixed_queue(None, "email"), "email");
        assert_eq!(prefixed_queue(Some("staging"), "email"), "staging-email");
    }
}
