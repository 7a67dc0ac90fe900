use std::sync::Arc;
use std::time::Duration;

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use relay_queues::{
    CompletionUpdate, FailDisposition, FailureKind, FailureReport, QueueBackend, QueueConfig,
    Waitlist,
};

use crate::error::{ApiError, Result};

/// Shared state for the transport routes. The waitlist is the same object
/// the in-process client signals, so `/wait` wakes on local enqueues; the
/// PostgreSQL notify bridge extends that across processes.
pub struct ApiState {
    pub backend: Arc<dyn QueueBackend>,
    pub waitlist: Waitlist,
    pub config: QueueConfig,
}

pub type AppStateData = web::Data<ApiState>;

#[derive(Debug, Deserialize)]
struct ClaimQuery {
    queue: String,
    worker: String,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    queue: String,
    worker: String,
    /// Milliseconds; clamped into the configured band.
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerBody {
    worker: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody {
    worker: String,
    artifacts: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailBody {
    worker: String,
    error: String,
    #[serde(default)]
    permanent: bool,
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RescheduleBody {
    worker: String,
    delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    queue: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailResponse {
    pub ok: bool,
    /// "retry_pending" | "failed"
    pub disposition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

#[get("/jobs/fetch")]
async fn fetch_job(query: web::Query<ClaimQuery>, data: AppStateData) -> Result<impl Responder> {
    let job = data
        .backend
        .claim(&query.queue, &query.worker, data.config.lease_duration)
        .await?;
    Ok(HttpResponse::Ok().json(job))
}

#[get("/jobs/wait")]
async fn wait_for_job(query: web::Query<WaitQuery>, data: AppStateData) -> Result<impl Responder> {
    let timeout = data.config.clamp_wait_timeout(Duration::from_millis(
        query.timeout.unwrap_or(30_000),
    ));

    if let Some(job) = data
        .backend
        .claim(&query.queue, &query.worker, data.config.lease_duration)
        .await?
    {
        return Ok(HttpResponse::Ok().json(Some(job)));
    }

    // Park until an enqueue (or the scheduled-work timer) signals, then
    // race the claim once more. A losing race returns null; the remote
    // worker just polls again.
    data.waitlist.wait(&query.queue, &query.worker, timeout).await;

    let job = data
        .backend
        .claim(&query.queue, &query.worker, data.config.lease_duration)
        .await?;
    Ok(HttpResponse::Ok().json(job))
}

#[post("/jobs/{id}/heartbeat")]
async fn heartbeat(
    id: web::Path<String>,
    body: web::Json<WorkerBody>,
    data: AppStateData,
) -> Result<impl Responder> {
    let extended = data
        .backend
        .heartbeat(&id, &body.worker, data.config.lease_duration)
        .await?;
    if !extended {
        return Err(ApiError::NotOwned);
    }
    Ok(HttpResponse::Ok().json(AckResponse { ok: true }))
}

#[post("/jobs/{id}/complete")]
async fn complete_job(
    id: web::Path<String>,
    body: web::Json<CompleteBody>,
    data: AppStateData,
) -> Result<impl Responder> {
    let body = body.into_inner();
    let update = CompletionUpdate {
        artifacts: body.artifacts,
        ..CompletionUpdate::default()
    };
    let completed = data.backend.complete(&id, &body.worker, update).await?;
    if !completed {
        return Err(ApiError::NotOwned);
    }
    Ok(HttpResponse::Ok().json(AckResponse { ok: true }))
}

#[post("/jobs/{id}/fail")]
async fn fail_job(
    id: web::Path<String>,
    body: web::Json<FailBody>,
    data: AppStateData,
) -> Result<impl Responder> {
    let body = body.into_inner();

    // Backpressure is not a failure: with retryAfterMs present the job is
    // released without consuming the attempt.
    if let Some(retry_after) = body.retry_after_ms {
        let delay = Duration::from_millis(retry_after);
        let rescheduled = data.backend.reschedule(&id, &body.worker, delay).await?;
        if !rescheduled {
            return Err(ApiError::NotOwned);
        }
        let at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        if let Some(queue) = queue_of(&data, &id).await? {
            data.waitlist.arm(&queue, at);
        }
        return Ok(HttpResponse::Ok().json(FailResponse {
            ok: true,
            disposition: "retry_pending".to_string(),
            retry_at: Some(at),
        }));
    }

    let kind = if body.permanent {
        FailureKind::Permanent
    } else {
        FailureKind::Retryable
    };
    let disposition = data
        .backend
        .fail(
            &id,
            &body.worker,
            FailureReport {
                message: body.error,
                kind,
            },
        )
        .await?;

    match disposition {
        FailDisposition::RetryPending { at } => {
            if let Some(queue) = queue_of(&data, &id).await? {
                data.waitlist.arm(&queue, at);
            }
            Ok(HttpResponse::Ok().json(FailResponse {
                ok: true,
                disposition: "retry_pending".to_string(),
                retry_at: Some(at),
            }))
        }
        FailDisposition::Failed => Ok(HttpResponse::Ok().json(FailResponse {
            ok: true,
            disposition: "failed".to_string(),
            retry_at: None,
        })),
        FailDisposition::NotOwned => Err(ApiError::NotOwned),
    }
}

#[post("/jobs/{id}/reschedule")]
async fn reschedule_job(
    id: web::Path<String>,
    body: web::Json<RescheduleBody>,
    data: AppStateData,
) -> Result<impl Responder> {
    let delay = Duration::from_millis(body.delay_ms);
    let rescheduled = data.backend.reschedule(&id, &body.worker, delay).await?;
    if !rescheduled {
        return Err(ApiError::NotOwned);
    }
    let at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
    if let Some(queue) = queue_of(&data, &id).await? {
        data.waitlist.arm(&queue, at);
    }
    Ok(HttpResponse::Ok().json(AckResponse { ok: true }))
}

#[get("/jobs/stats")]
async fn queue_stats(query: web::Query<StatsQuery>, data: AppStateData) -> Result<impl Responder> {
    let stats = data.backend.stats(query.queue.as_deref()).await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn queue_of(data: &AppStateData, id: &str) -> Result<Option<String>> {
    let job = data
        .backend
        .get_job(&relay_queues::JobRef::Id(id.to_string()))
        .await
        .unwrap_or_else(|e| {
            event!(Level::WARN, job = %id, error = %e, "Queue lookup for waitlist arm failed");
            None
        });
    Ok(job.map(|j| j.queue))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(fetch_job)
        .service(wait_for_job)
        .service(heartbeat)
        .service(complete_job)
        .service(fail_job)
        .service(reschedule_job)
        .service(queue_stats);
}
