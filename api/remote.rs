use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_graceful_shutdown::GracefulShutdownConsumer;
use reqwest::StatusCode;
use tracing::{event, Level};

use relay_queues::{
    Capabilities, CompletionUpdate, EnqueueOutcome, EnqueueRequest, Error, FailDisposition,
    FailureKind, FailureReport, JobRecord, JobRef, ProgressUpdate, QueueBackend, QueueConfig,
    QueueRuntime, QueueStats, UnsupportedScheduleStore, Waitlist,
};

use crate::routes::FailResponse;

/// The queue contract spoken over HTTP: a worker process holds this instead
/// of a database handle. Claims long-poll `/jobs/wait`; mutations go to the
/// matching endpoints; heartbeats are scheduled client-side by the worker
/// runtime exactly as for local backends.
pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> RemoteBackend {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        RemoteBackend {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn lost(err: reqwest::Error) -> Error {
        Error::ConnectionLost(anyhow::anyhow!(err))
    }
}

/// Build a runtime whose backend is a remote transport. Workers built from
/// it long-poll the server; schedules and enqueues stay with the service
/// that owns the storage.
pub fn connect_remote_runtime(
    base_url: impl Into<String>,
    config: QueueConfig,
    shutdown: GracefulShutdownConsumer,
) -> QueueRuntime {
    QueueRuntime::with_parts(
        Arc::new(RemoteBackend::new(base_url)),
        Arc::new(UnsupportedScheduleStore),
        Waitlist::new(),
        config,
        shutdown,
    )
}

#[async_trait]
impl QueueBackend for RemoteBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::HTTP
    }

    async fn enqueue(&self, _req: EnqueueRequest) -> Result<EnqueueOutcome, Error> {
        Err(Error::Unsupported("enqueue over the worker transport"))
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &str,
        _lease: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        let response = self
            .client
            .get(self.url("/jobs/fetch"))
            .query(&[("queue", queue), ("worker", worker)])
            .send()
            .await
            .map_err(Self::lost)?
            .error_for_status()
            .map_err(Self::lost)?;
        response.json().await.map_err(Self::lost)
    }

    async fn claim_wait(
        &self,
        queue: &str,
        worker: &str,
        _lease: Duration,
        timeout: Duration,
    ) -> Result<Option<JobRecord>, Error> {
        let timeout_ms = timeout.as_millis().to_string();
        let response = self
            .client
            .get(self.url("/jobs/wait"))
            .query(&[
                ("queue", queue),
                ("worker", worker),
                ("timeout", timeout_ms.as_str()),
            ])
            // The server clamps the wait; leave slack for the round trip.
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(Self::lost)?
            .error_for_status()
            .map_err(Self::lost)?;
        response.json().await.map_err(Self::lost)
    }

    async fn heartbeat(&self, id: &str, worker: &str, _lease: Duration) -> Result<bool, Error> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/heartbeat", id)))
            .json(&serde_json::json!({ "worker": worker }))
            .send()
            .await
            .map_err(Self::lost)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Error::ConnectionLost(anyhow::anyhow!(
                "heartbeat returned {}",
                response.status()
            ))),
        }
    }

    async fn complete(
        &self,
        id: &str,
        worker: &str,
        update: CompletionUpdate,
    ) -> Result<bool, Error> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/complete", id)))
            .json(&serde_json::json!({
                "worker": worker,
                "artifacts": update.artifacts,
            }))
            .send()
            .await
            .map_err(Self::lost)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Error::ConnectionLost(anyhow::anyhow!(
                "complete returned {}",
                response.status()
            ))),
        }
    }

    async fn fail(
        &self,
        id: &str,
        worker: &str,
        report: FailureReport,
    ) -> Result<FailDisposition, Error> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/fail", id)))
            .json(&serde_json::json!({
                "worker": worker,
                "error": report.message,
                "permanent": report.kind == FailureKind::Permanent,
            }))
            .send()
            .await
            .map_err(Self::lost)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(FailDisposition::NotOwned),
            status if status.is_success() => {
                let body: FailResponse = response.json().await.map_err(Self::lost)?;
                match (body.disposition.as_str(), body.retry_at) {
                    ("retry_pending", Some(at)) => Ok(FailDisposition::RetryPending { at }),
                    ("failed", _) => Ok(FailDisposition::Failed),
                    (other, _) => Err(Error::ConnectionLost(anyhow::anyhow!(
                        "unexpected fail disposition {}",
                        other
                    ))),
                }
            }
            status => Err(Error::ConnectionLost(anyhow::anyhow!(
                "fail returned {}",
                status
            ))),
        }
    }

    async fn reschedule(&self, id: &str, worker: &str, delay: Duration) -> Result<bool, Error> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/reschedule", id)))
            .json(&serde_json::json!({
                "worker": worker,
                "delayMs": delay.as_millis() as u64,
            }))
            .send()
            .await
            .map_err(Self::lost)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::ConnectionLost(anyhow::anyhow!(
                "reschedule returned {}",
                status
            ))),
        }
    }

    /// There is no progress route on the transport; stage state stays in
    /// the remote worker's context and the final artifacts travel with
    /// `/complete`. Reporting success keeps stage bookkeeping flowing.
    async fn update_progress(
        &self,
        id: &str,
        _worker: &str,
        _update: ProgressUpdate,
    ) -> Result<bool, Error> {
        event!(Level::DEBUG, job = %id, "Progress update kept client-side");
        Ok(true)
    }

    async fn cancel(&self, _job: &JobRef) -> Result<bool, Error> {
        Err(Error::Unsupported("cancel over the worker transport"))
    }

    async fn retry(&self, _job: &JobRef) -> Result<bool, Error> {
        Err(Error::Unsupported("retry over the worker transport"))
    }

    async fn get_job(&self, _job: &JobRef) -> Result<Option<JobRecord>, Error> {
        Err(Error::Unsupported("lookup over the worker transport"))
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, Error> {
        let mut request = self.client.get(self.url("/jobs/stats"));
        if let Some(queue) = queue {
            request = request.query(&[("queue", queue)]);
        }
        let response = request
            .send()
            .await
            .map_err(Self::lost)?
            .error_for_status()
            .map_err(Self::lost)?;
        response.json().await.map_err(Self::lost)
    }
}
