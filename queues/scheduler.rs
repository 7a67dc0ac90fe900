use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_graceful_shutdown::GracefulShutdownConsumer;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::config::QueueConfig;
use crate::contract::{EnqueueRequest, QueueBackend, ScheduleStore};
use crate::error::Error;
use crate::util::{self, stop_channel, StopSignal, StopSource};
use crate::waitlist::Waitlist;

/// Safety interval: the loop re-checks at least this often even when no
/// schedule is due, picking up definitions added by other processes.
const SAFETY_INTERVAL: Duration = Duration::from_secs(5);
const DUE_BATCH: i64 = 50;

/// When a schedule fires again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    /// 5-field (minute-resolution) or 6-field (second-resolution) cron
    /// expression, evaluated in UTC.
    Cron(String),
    /// Fixed interval in milliseconds.
    #[serde(with = "interval_millis")]
    Every(Duration),
    /// Single shot at the given instant.
    At(DateTime<Utc>),
}

mod interval_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Normalize a cron expression to the 6-field form the parser wants.
/// 5 fields get a `0` seconds column prepended; anything that is not 5 or 6
/// fields is rejected before parsing.
pub fn normalize_cron(expr: &str) -> Result<String, Error> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 => fields.join(" "),
        n => {
            return Err(Error::InvalidCron(
                expr.to_string(),
                format!("expected 5 or 6 fields, got {}", n),
            ))
        }
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidCron(expr.to_string(), e.to_string()))?;
    Ok(normalized)
}

impl ScheduleTrigger {
    pub fn validate(&self) -> Result<(), Error> {
        if let ScheduleTrigger::Cron(expr) = self {
            normalize_cron(expr)?;
        }
        Ok(())
    }

    /// The first firing strictly after `now`. One-shot triggers return their
    /// instant until it has passed.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        match self {
            ScheduleTrigger::Cron(expr) => {
                let normalized = normalize_cron(expr)?;
                let schedule = cron::Schedule::from_str(&normalized)
                    .map_err(|e| Error::InvalidCron(expr.clone(), e.to_string()))?;
                Ok(schedule.after(&now).next())
            }
            ScheduleTrigger::Every(interval) => Ok(Some(util::after(now, *interval))),
            ScheduleTrigger::At(at) => Ok(if *at > now { Some(*at) } else { None }),
        }
    }

    fn is_one_shot(&self) -> bool {
        matches!(self, ScheduleTrigger::At(_))
    }
}

/// Caller-facing definition of a recurring or future single-shot job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub key: String,
    pub queue: String,
    pub trigger: ScheduleTrigger,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Fire one job synchronously when the spec is upserted.
    #[serde(default)]
    pub immediate: bool,
}

/// A schedule as stored: the spec plus firing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub key: String,
    pub queue: String,
    pub trigger: ScheduleTrigger,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    fn from_spec(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<ScheduleRecord, Error> {
        spec.trigger.validate()?;
        let next_run_at = spec.trigger.next_after(now)?;
        Ok(ScheduleRecord {
            key: spec.key.clone(),
            queue: spec.queue.clone(),
            trigger: spec.trigger.clone(),
            payload: spec.payload.clone(),
            limit: spec.limit,
            end_date: spec.end_date,
            next_run_at,
            run_count: 0,
            enabled: next_run_at.is_some() || spec.immediate,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the schedule may fire again after `fired_count` total runs,
    /// considering limit, end date, and one-shot triggers.
    fn still_enabled(&self, fired_count: u32, next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if self.trigger.is_one_shot() {
            return false;
        }
        if let Some(limit) = self.limit {
            if fired_count >= limit {
                return false;
            }
        }
        match (next, self.end_date) {
            (None, _) => false,
            (Some(_), Some(end)) if now >= end => false,
            (Some(n), Some(end)) if n > end => false,
            _ => true,
        }
    }
}

struct SchedulerInner {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn ScheduleStore>,
    waitlist: Waitlist,
    config: QueueConfig,
    shutdown: GracefulShutdownConsumer,
}

/// Owns the recurring-job loop for one deployment. Several instances may run
/// against the same store; the optimistic advance guard makes firing
/// exactly-once per occurrence.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    loop_task: Mutex<Option<(StopSource, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn ScheduleStore>,
        waitlist: Waitlist,
        config: QueueConfig,
        shutdown: GracefulShutdownConsumer,
    ) -> Scheduler {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                backend,
                store,
                waitlist,
                config,
                shutdown,
            }),
            loop_task: Mutex::new(None),
        }
    }

    /// Create or replace a schedule by key. With `immediate`, one job is
    /// enqueued before this returns; that firing counts toward the limit.
    pub async fn upsert(&self, spec: ScheduleSpec) -> Result<ScheduleRecord, Error> {
        if spec.key.is_empty() {
            return Err(Error::Validation("schedule key must not be empty".into()));
        }
        let now = Utc::now();
        let mut record = ScheduleRecord::from_spec(&spec, now)?;

        if spec.immediate {
            fire_schedule(&self.inner, &record).await?;
            record.run_count = 1;
            record.enabled = record.still_enabled(1, record.next_run_at, now)
                && record.next_run_at.is_some();
            if !record.enabled {
                record.next_run_at = None;
            }
        }

        self.inner.store.upsert_schedule(&record).await?;
        event!(Level::INFO, key = %record.key, queue = %record.queue, next = ?record.next_run_at, "Upserted schedule");
        Ok(record)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, Error> {
        self.inner.store.remove_schedule(key).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<ScheduleRecord>, Error> {
        self.inner.store.get_schedule(key).await
    }

    pub async fn list(&self) -> Result<Vec<ScheduleRecord>, Error> {
        self.inner.store.list_schedules().await
    }

    /// Start the firing loop. Idempotent.
    pub fn start(&self) {
        let mut slot = self.loop_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        event!(Level::INFO, "Starting scheduler loop");

        let (stop_source, stop_signal) = stop_channel();
        let inner = self.inner.clone();
        let task = tokio::spawn(run_loop(inner, stop_signal));
        *slot = Some((stop_source, task));
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        let taken = self.loop_task.lock().unwrap().take();
        if let Some((stop_source, task)) = taken {
            stop_source.stop();
            task.await.ok();
        }
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, mut stop: StopSignal) {
    let mut shutdown = inner.shutdown.clone();
    loop {
        if let Err(e) = fire_due(&inner).await {
            event!(Level::ERROR, error = %e, "Error firing due schedules");
        }

        let now = Utc::now();
        let sleep_for = match inner.store.next_schedule_wake().await {
            Ok(Some(next)) if next > now => ((next - now)
                .to_std()
                .unwrap_or(SAFETY_INTERVAL))
            .min(SAFETY_INTERVAL),
            Ok(Some(_)) => Duration::from_millis(0),
            Ok(None) => SAFETY_INTERVAL,
            Err(e) => {
                event!(Level::ERROR, error = %e, "Error reading schedule wake time");
                SAFETY_INTERVAL
            }
        };

        tokio::select! {
            biased;

            _ = shutdown.wait_for_shutdown() => break,
            _ = stop.wait() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    event!(Level::INFO, "Scheduler loop stopped");
}

async fn fire_due(inner: &Arc<SchedulerInner>) -> Result<(), Error> {
    let now = Utc::now();
    let due = inner.store.due_schedules(now, DUE_BATCH).await?;

    for record in due {
        let next = record.trigger.next_after(now)?;
        let fired_count = record.run_count + 1;
        let enabled = record.still_enabled(fired_count, next, now);
        let next = if enabled { next } else { None };

        // Advance first; losing the guarded update means another scheduler
        // instance owns this occurrence.
        let won = inner
            .store
            .advance_schedule(&record.key, record.next_run_at, next, enabled)
            .await?;
        if !won {
            continue;
        }

        match fire_schedule(inner, &record).await {
            Ok(job_id) => {
                event!(
                    Level::INFO,
                    key = %record.key,
                    queue = %record.queue,
                    job = %job_id,
                    run = fired_count,
                    "Fired schedule"
                );
            }
            Err(e) => {
                event!(Level::ERROR, key = %record.key, error = %e, "Error enqueueing scheduled job");
            }
        }
    }
    Ok(())
}

/// Enqueue one occurrence of a schedule; returns the job id.
async fn fire_schedule(inner: &SchedulerInner, record: &ScheduleRecord) -> Result<String, Error> {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert(
        "scheduleKey".to_string(),
        serde_json::Value::String(record.key.clone()),
    );

    let request = EnqueueRequest {
        id: util::new_job_id(),
        queue: record.queue.clone(),
        payload: record.payload.clone(),
        idempotency_key: None,
        priority: None,
        scheduled_for: None,
        max_attempts: inner.config.default_max_attempts,
        backoff: inner.config.default_backoff,
        stages: Vec::new(),
        metadata: Some(metadata),
        replace_if_not_active: false,
    };

    let outcome = inner.backend.enqueue(request).await?;
    inner.waitlist.notify(&record.queue);
    Ok(outcome.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gains_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(normalize_cron("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn wrong_field_counts_are_rejected() {
        assert_matches::assert_matches!(
            normalize_cron("* * * *"),
            Err(Error::InvalidCron(_, _))
        );
        assert_matches::assert_matches!(
            normalize_cron("* * * * * * *"),
            Err(Error::InvalidCron(_, _))
        );
        assert_matches::assert_matches!(
            normalize_cron("not a cron at all"),
            Err(Error::InvalidCron(_, _))
        );
    }

    #[test]
    fn cron_next_is_in_the_future() {
        let trigger = ScheduleTrigger::Cron("*/1 * * * *".to_string());
        let now = Utc::now();
        let next = trigger.next_after(now).unwrap().unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(61));
    }

    #[test]
    fn interval_next_adds_the_interval() {
        let trigger = ScheduleTrigger::Every(Duration::from_secs(90));
        let now = Utc::now();
        let next = trigger.next_after(now).unwrap().unwrap();
        assert_eq!(next - now, chrono::Duration::seconds(90));
    }

    #[test]
    fn one_shot_fires_once() {
        let now = Utc::now();
        let future = now + chrono::Duration::minutes(5);
        let trigger = ScheduleTrigger::At(future);
        assert_eq!(trigger.next_after(now).unwrap(), Some(future));
        assert_eq!(trigger.next_after(future).unwrap(), None);
    }

    fn record(trigger: ScheduleTrigger, limit: Option<u32>, end: Option<DateTime<Utc>>) -> ScheduleRecord {
        let now = Utc::now();
        ScheduleRecord {
            key: "k".into(),
            queue: "q".into(),
            trigger,
            payload: serde_json::json!({}),
            limit,
            end_date: end,
            next_run_at: Some(now),
            run_count: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn limit_disables_after_enough_firings() {
        let now = Utc::now();
        let rec = record(ScheduleTrigger::Every(Duration::from_secs(60)), Some(2), None);
        let next = Some(now + chrono::Duration::seconds(60));
        assert!(rec.still_enabled(1, next, now));
        assert!(!rec.still_enabled(2, next, now));
    }

    #[test]
    fn end_date_disables() {
        let now = Utc::now();
        let end = now + chrono::Duration::seconds(30);
        let rec = record(
            ScheduleTrigger::Every(Duration::from_secs(60)),
            None,
            Some(end),
        );
        // Next firing lands past the end date.
        let next = Some(now + chrono::Duration::seconds(60));
        assert!(!rec.still_enabled(1, next, now));

        let rec = record(
            ScheduleTrigger::Every(Duration::from_secs(10)),
            None,
            Some(now + chrono::Duration::hours(1)),
        );
        let next = Some(now + chrono::Duration::seconds(10));
        assert!(rec.still_enabled(1, next, now));
    }

    #[test]
    fn one_shot_always_disables_after_fire() {
        let now = Utc::now();
        let rec = record(ScheduleTrigger::At(now + chrono::Duration::minutes(1)), None, None);
        assert!(!rec.still_enabled(1, None, now));
    }

    #[test]
    fn spec_round_trips_through_record() {
        let now = Utc::now();
        let spec = ScheduleSpec {
            key: "daily-report".into(),
            queue: "reports".into(),
            trigger: ScheduleTrigger::Cron("0 8 * * *".into()),
            payload: serde_json::json!({"kind": "daily"}),
            limit: None,
            end_date: None,
            immediate: false,
        };
        let rec = ScheduleRecord::from_spec(&spec, now).unwrap();
        assert_eq!(rec.run_count, 0);
        assert!(rec.enabled);
        assert!(rec.next_run_at.unwrap() > now);
    }
}
