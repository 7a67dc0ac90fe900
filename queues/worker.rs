use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use relay_graceful_shutdown::GracefulShutdownConsumer;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{event, Level};

use crate::config::QueueConfig;
use crate::contract::{CompletionUpdate, FailDisposition, FailureKind, FailureReport, QueueBackend};
use crate::context::JobContext;
use crate::error::HandlerError;
use crate::events::{EventBus, JobEventKind};
use crate::job::JobRecord;
use crate::util::{self, cancellable_sleep, stop_channel, StopSignal, StopSource};
use crate::waitlist::Waitlist;

/// A unit of application logic bound to a queue. Returning `Ok` completes
/// the job (the value becomes job-level artifacts); error variants map onto
/// the matching queue transitions.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> Result<Option<serde_json::Value>, HandlerError>;
}

/// Adapter so plain async functions and closures can act as handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<serde_json::Value>, HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<Option<serde_json::Value>, HandlerError> {
        (self.0)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<serde_json::Value>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct WorkerInner {
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
    waitlist: Waitlist,
    config: QueueConfig,
    queue: String,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    worker_id: String,
    shutdown: GracefulShutdownConsumer,
    /// Abort handles for in-flight handler tasks, so a drain that exceeds
    /// the grace deadline can cut them loose.
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    next_task_id: std::sync::atomic::AtomicU64,
}

struct RunningState {
    stop: StopSource,
    consumers: Vec<JoinHandle<()>>,
}

/// Hosts N consumer tasks that independently claim, execute and report jobs
/// from one queue.
pub struct Worker {
    inner: Arc<WorkerInner>,
    state: Mutex<Option<RunningState>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        events: EventBus,
        waitlist: Waitlist,
        config: QueueConfig,
        shutdown: GracefulShutdownConsumer,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Worker {
        let concurrency = if concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            concurrency
        };
        Worker {
            inner: Arc::new(WorkerInner {
                backend,
                events,
                waitlist,
                config,
                queue: queue.into(),
                handler,
                concurrency,
                worker_id: util::worker_id("relay"),
                shutdown,
                in_flight: Mutex::new(HashMap::new()),
                next_task_id: std::sync::atomic::AtomicU64::new(1),
            }),
            state: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Poll backoff used when the queue is empty or the backend is away.
    fn poll_backoff(max: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(50),
            initial_interval: Duration::from_millis(50),
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Spawn the consumer tasks. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return;
        }

        event!(
            Level::INFO,
            queue = %self.inner.queue,
            worker = %self.inner.worker_id,
            concurrency = self.inner.concurrency,
            "Starting worker"
        );

        let (stop, signal) = stop_channel();
        let consumers = (0..self.inner.concurrency)
            .map(|idx| {
                let inner = self.inner.clone();
                let signal = signal.clone();
                tokio::spawn(consumer_loop(inner, idx, signal))
            })
            .collect();

        *state = Some(RunningState { stop, consumers });
    }

    /// Stop acquiring work, signal in-flight contexts, and drain up to the
    /// grace deadline. Handlers that outlive the deadline are aborted.
    pub async fn stop(&self) {
        let taken = self.state.lock().unwrap().take();
        let Some(RunningState { stop, consumers }) = taken else {
            return;
        };

        event!(Level::INFO, queue = %self.inner.queue, worker = %self.inner.worker_id, "Stopping worker");
        stop.stop();

        let drain = futures::future::join_all(consumers);
        if tokio::time::timeout(self.inner.config.graceful_shutdown, drain)
            .await
            .is_err()
        {
            event!(
                Level::WARN,
                queue = %self.inner.queue,
                "Drain deadline exceeded; aborting in-flight handlers"
            );
            let handles: Vec<AbortHandle> = {
                let mut in_flight = self.inner.in_flight.lock().unwrap();
                in_flight.drain().map(|(_, h)| h).collect()
            };
            for handle in handles {
                handle.abort();
            }
        }
    }
}

async fn consumer_loop(inner: Arc<WorkerInner>, idx: usize, mut stop: StopSignal) {
    let mut shutdown = inner.shutdown.clone();
    let mut backoff = Worker::poll_backoff(inner.config.poll_interval);
    let long_poll = inner.backend.capabilities().long_poll;

    loop {
        if stop.stopping() || shutdown.shutting_down() {
            break;
        }

        let claim = async {
            if long_poll {
                inner
                    .backend
                    .claim_wait(
                        &inner.queue,
                        &inner.worker_id,
                        inner.config.lease_duration,
                        inner.config.wait_timeout_max.min(Duration::from_secs(30)),
                    )
                    .await
            } else {
                inner
                    .backend
                    .claim(&inner.queue, &inner.worker_id, inner.config.lease_duration)
                    .await
            }
        };

        let claimed = tokio::select! {
            biased;

            _ = shutdown.wait_for_shutdown() => break,
            _ = stop.wait() => break,
            claimed = claim => claimed,
        };

        match claimed {
            Ok(Some(job)) => {
                backoff.reset();
                run_job(&inner, job, &stop).await;
            }
            Ok(None) => {
                if long_poll {
                    // The long poll already blocked server-side.
                    continue;
                }
                // Park on the waitlist; the poll interval is the fallback
                // when no enqueue wakes us.
                tokio::select! {
                    biased;

                    _ = stop.wait() => break,
                    _ = inner.waitlist.wait(&inner.queue, &inner.worker_id, inner.config.poll_interval) => {}
                }
            }
            Err(e) if e.is_connection() => {
                let sleep_for = backoff
                    .next_backoff()
                    .unwrap_or(inner.config.poll_interval);
                event!(
                    Level::ERROR,
                    queue = %inner.queue,
                    worker = %inner.worker_id,
                    error = %e,
                    "Backend unavailable; backing off"
                );
                if !cancellable_sleep(sleep_for, &mut stop).await {
                    break;
                }
            }
            Err(e) => {
                event!(Level::ERROR, queue = %inner.queue, error = %e, "Error claiming job");
                if !cancellable_sleep(inner.config.poll_interval, &mut stop).await {
                    break;
                }
            }
        }
    }

    event!(
        Level::DEBUG,
        queue = %inner.queue,
        worker = %inner.worker_id,
        consumer = idx,
        "Consumer stopped"
    );
}

async fn run_job(inner: &Arc<WorkerInner>, job: JobRecord, stop: &StopSignal) {
    let job_id = job.id.clone();
    let ctx = JobContext::new(
        inner.backend.clone(),
        inner.events.clone(),
        job,
        inner.worker_id.clone(),
        inner.config.lease_duration,
        stop.clone(),
    );

    // Independent lease-extension ticker for the duration of the handler.
    let heartbeat = spawn_heartbeat(inner.clone(), job_id.clone());

    // The handler runs in its own task so a panic is contained and so a
    // drain past the deadline can abort it.
    let handler = inner.handler.clone();
    let handler_ctx = ctx.clone();
    let task = tokio::spawn(async move { handler.run(handler_ctx).await });

    let task_id = inner
        .next_task_id
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    inner
        .in_flight
        .lock()
        .unwrap()
        .insert(task_id, task.abort_handle());

    let result = match task.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(HandlerError::Retryable(anyhow::anyhow!(
            "handler panicked: {}",
            join_err
        ))),
        Err(join_err) => Err(HandlerError::Retryable(anyhow::anyhow!(
            "handler aborted: {}",
            join_err
        ))),
    };

    inner.in_flight.lock().unwrap().remove(&task_id);
    heartbeat.abort();

    report_outcome(inner, &ctx, &job_id, result).await;
}

fn spawn_heartbeat(inner: Arc<WorkerInner>, job_id: String) -> JoinHandle<()> {
    let interval = inner.config.effective_heartbeat();
    let lease = inner.config.lease_duration;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match inner
                .backend
                .heartbeat(&job_id, &inner.worker_id, lease)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // Not ours anymore; the queue will hand it elsewhere.
                    event!(
                        Level::WARN,
                        job = %job_id,
                        worker = %inner.worker_id,
                        "Heartbeat rejected; lease lost"
                    );
                    break;
                }
                Err(e) => {
                    event!(Level::WARN, job = %job_id, error = %e, "Heartbeat failed");
                }
            }
        }
    })
}

async fn report_outcome(
    inner: &Arc<WorkerInner>,
    ctx: &JobContext,
    job_id: &str,
    result: Result<Option<serde_json::Value>, HandlerError>,
) {
    match result {
        Ok(returned) => {
            let (mut stages, ctx_artifacts) = ctx.final_state();
            let used_stages = !stages.is_empty();
            if used_stages {
                stages.finalize(Utc::now());
            }
            let artifacts = merge_artifacts(ctx_artifacts, returned);

            let update = CompletionUpdate {
                artifacts: artifacts.clone(),
                stages: if used_stages {
                    Some(stages.stages.clone())
                } else {
                    None
                },
                current_stage: stages.current.clone(),
                overall_progress: if used_stages { Some(100) } else { None },
            };

            match inner
                .backend
                .complete(job_id, &inner.worker_id, update)
                .await
            {
                Ok(true) => {
                    event!(Level::INFO, job = %job_id, queue = %inner.queue, "Job completed");
                    ctx.publish_outcome(JobEventKind::Completed { artifacts });
                }
                Ok(false) => {
                    event!(Level::WARN, job = %job_id, "Completion skipped; lease no longer held");
                }
                Err(e) => {
                    event!(Level::ERROR, job = %job_id, error = %e, "Error completing job");
                }
            }
        }
        Err(HandlerError::RateLimit(delay)) => {
            match inner
                .backend
                .reschedule(job_id, &inner.worker_id, delay)
                .await
            {
                Ok(true) => {
                    let at = util::after(Utc::now(), delay);
                    event!(
                        Level::INFO,
                        job = %job_id,
                        queue = %inner.queue,
                        delay_ms = delay.as_millis() as u64,
                        "Job rate limited; rescheduled"
                    );
                    inner.waitlist.arm(&inner.queue, at);
                }
                Ok(false) => {
                    event!(Level::WARN, job = %job_id, "Reschedule skipped; lease no longer held");
                }
                Err(e) => {
                    event!(Level::ERROR, job = %job_id, error = %e, "Error rescheduling job");
                }
            }
        }
        Err(err) => {
            let kind = match &err {
                HandlerError::Permanent(_) => FailureKind::Permanent,
                _ => FailureKind::Retryable,
            };
            let message = err.to_string();
            match inner
                .backend
                .fail(
                    job_id,
                    &inner.worker_id,
                    FailureReport {
                        message: message.clone(),
                        kind,
                    },
                )
                .await
            {
                Ok(FailDisposition::RetryPending { at }) => {
                    event!(
                        Level::WARN,
                        job = %job_id,
                        queue = %inner.queue,
                        retry_at = %at,
                        error = %message,
                        "Job failed; retry scheduled"
                    );
                    inner.waitlist.arm(&inner.queue, at);
                }
                Ok(FailDisposition::Failed) => {
                    event!(
                        Level::ERROR,
                        job = %job_id,
                        queue = %inner.queue,
                        error = %message,
                        "Job failed permanently"
                    );
                    ctx.publish_outcome(JobEventKind::Failed { error: message });
                }
                Ok(FailDisposition::NotOwned) => {
                    event!(Level::WARN, job = %job_id, "Failure report skipped; lease no longer held");
                }
                Err(e) => {
                    event!(Level::ERROR, job = %job_id, error = %e, "Error recording job failure");
                }
            }
        }
    }
}

fn merge_artifacts(
    from_stages: Option<serde_json::Value>,
    returned: Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    match (from_stages, returned) {
        (Some(serde_json::Value::Object(mut base)), Some(serde_json::Value::Object(extra))) => {
            for (k, v) in extra {
                base.insert(k, v);
            }
            Some(serde_json::Value::Object(base))
        }
        (base, None) => base,
        (None, returned) => returned,
        (_, returned @ Some(_)) => returned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_prefers_returned_keys() {
        let merged = merge_artifacts(
            Some(json!({"a": 1, "b": 2})),
            Some(json!({"b": 3, "c": 4})),
        );
        assert_eq!(merged, Some(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[test]
    fn merge_handles_missing_sides() {
        assert_eq!(merge_artifacts(None, None), None);
        assert_eq!(
            merge_artifacts(Some(json!({"a": 1})), None),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            merge_artifacts(None, Some(json!({"b": 2}))),
            Some(json!({"b": 2}))
        );
    }
}
