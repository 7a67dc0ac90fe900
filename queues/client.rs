use std::sync::Arc;

use chrono::Utc;
use tracing::{event, Level};

use crate::config::QueueConfig;
use crate::contract::{EnqueueDisposition, EnqueueOutcome, EnqueueRequest, QueueBackend, QueueStats};
use crate::error::Error;
use crate::job::{EnqueueOptions, JobRecord, JobRef};
use crate::util;
use crate::waitlist::Waitlist;

/// Producer-side handle: enqueue, cancel, retry, lookup, stats. Cheap to
/// clone; all clones share the backend and the waitlist.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn QueueBackend>,
    waitlist: Waitlist,
    config: QueueConfig,
}

impl Client {
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        waitlist: Waitlist,
        config: QueueConfig,
    ) -> Client {
        Client {
            backend,
            waitlist,
            config,
        }
    }

    fn build_request(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<EnqueueRequest, Error> {
        if queue.is_empty() {
            return Err(Error::Validation("queue name must not be empty".into()));
        }
        if let Some(max) = options.max_attempts {
            if max < 1 {
                return Err(Error::Validation("max_attempts must be at least 1".into()));
            }
        }

        let now = Utc::now();
        Ok(EnqueueRequest {
            id: util::new_job_id(),
            queue: queue.to_string(),
            payload,
            idempotency_key: options.idempotency_key.clone(),
            priority: options.priority,
            scheduled_for: options.scheduled_for(now),
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            backoff: options.backoff.unwrap_or(self.config.default_backoff),
            stages: options.stages.clone(),
            metadata: options.metadata.clone(),
            replace_if_not_active: matches!(
                options.replace,
                crate::job::ReplaceMode::IfNotActive
            ),
        })
    }

    fn signal_waitlist(&self, queue: &str, outcome: &EnqueueOutcome) {
        if outcome.disposition == EnqueueDisposition::ExistingKept {
            return;
        }
        match outcome.scheduled_for {
            Some(at) if at > Utc::now() => self.waitlist.arm(queue, at),
            _ => self.waitlist.notify(queue),
        }
    }

    /// Enqueue one job and return its id. See `EnqueueOptions` for the
    /// idempotency and replacement semantics.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, Error> {
        let request = self.build_request(queue, payload, &options)?;
        let outcome = self.backend.enqueue(request).await?;

        event!(
            Level::DEBUG,
            queue,
            job = %outcome.id,
            disposition = ?outcome.disposition,
            "Enqueued job"
        );
        self.signal_waitlist(queue, &outcome);
        Ok(outcome.id)
    }

    /// Enqueue a batch. Jobs are inserted in order; the waitlist is
    /// signalled once per job so idle consumers fan out.
    pub async fn enqueue_many(
        &self,
        queue: &str,
        jobs: impl IntoIterator<Item = (serde_json::Value, EnqueueOptions)>,
    ) -> Result<Vec<String>, Error> {
        let mut ids = Vec::new();
        for (payload, options) in jobs {
            ids.push(self.enqueue(queue, payload, options).await?);
        }
        Ok(ids)
    }

    /// Cancel a job that has not started. Processing jobs are left alone.
    pub async fn cancel(&self, job: &JobRef) -> Result<bool, Error> {
        self.backend.cancel(job).await
    }

    /// Re-run a failed job now, preserving its attempt count.
    pub async fn retry(&self, job: &JobRef) -> Result<bool, Error> {
        let retried = self.backend.retry(job).await?;
        if retried {
            if let Some(queue) = self.queue_of(job).await? {
                self.waitlist.notify(&queue);
            }
        }
        Ok(retried)
    }

    pub async fn get_job(&self, job: &JobRef) -> Result<Option<JobRecord>, Error> {
        self.backend.get_job(job).await
    }

    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, Error> {
        self.backend.stats(queue).await
    }

    async fn queue_of(&self, job: &JobRef) -> Result<Option<String>, Error> {
        match job {
            JobRef::Key { queue, .. } => Ok(Some(queue.clone())),
            JobRef::Id(_) => Ok(self.backend.get_job(job).await?.map(|j| j.queue)),
        }
    }
}
