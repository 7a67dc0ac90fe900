//! Transport routes exercised in-process over the SQLite backend.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, web, App};
use serde_json::json;

use relay_api::routes::{self, ApiState};
use relay_queues::db::SqliteBackend;
use relay_queues::{
    EnqueueRequest, JobRecord, JobRef, JobStatus, QueueBackend, QueueConfig, QueueStats,
    RetryPolicy, Waitlist,
};

async fn state() -> web::Data<ApiState> {
    let mut config = QueueConfig::default();
    config.lease_duration = Duration::from_secs(5);
    config.jitter_factor = 0.0;
    config.default_backoff = RetryPolicy::Fixed {
        base: Duration::from_millis(50),
    };
    let backend = SqliteBackend::connect("sqlite::memory:", config.clone())
        .await
        .expect("sqlite backend");
    web::Data::new(ApiState {
        backend: Arc::new(backend),
        waitlist: Waitlist::new(),
        config,
    })
}

fn request(queue: &str, payload: serde_json::Value) -> EnqueueRequest {
    EnqueueRequest {
        id: uuid_like(),
        queue: queue.to_string(),
        payload,
        idempotency_key: None,
        priority: None,
        scheduled_for: None,
        max_attempts: 3,
        backoff: RetryPolicy::Fixed {
            base: Duration::from_millis(50),
        },
        stages: Vec::new(),
        metadata: None,
        replace_if_not_active: false,
    }
}

fn uuid_like() -> String {
    format!("job-{}", std::process::id() as u64 + rand_suffix())
}

fn rand_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed) * 100_000
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .configure(routes::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn fetch_returns_null_when_empty() {
    let state = state().await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/jobs/fetch?queue=email&worker=w1")
        .to_request();
    let body: Option<JobRecord> = test::call_and_read_body_json(&app, req).await;
    assert!(body.is_none());
}

#[actix_web::test]
async fn fetch_claims_a_job() {
    let state = state().await;
    let app = app!(state);

    state
        .backend
        .enqueue(request("email", json!({"to": "a@b"})))
        .await
        .unwrap();

    let req = test::TestRequest::get()
        .uri("/jobs/fetch?queue=email&worker=w1")
        .to_request();
    let job: Option<JobRecord> = test::call_and_read_body_json(&app, req).await;
    let job = job.expect("job claimed");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.locked_by.as_deref(), Some("w1"));
    assert_eq!(job.attempts_made, 1);
}

#[actix_web::test]
async fn heartbeat_404s_for_wrong_worker() {
    let state = state().await;
    let app = app!(state);

    let outcome = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w1", state.config.lease_duration)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/heartbeat", outcome.id))
        .set_json(json!({"worker": "intruder"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/heartbeat", outcome.id))
        .set_json(json!({"worker": "w1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn complete_round_trip_persists_artifacts() {
    let state = state().await;
    let app = app!(state);

    let outcome = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w1", state.config.lease_duration)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/complete", outcome.id))
        .set_json(json!({"worker": "w1", "artifacts": {"messageId": "m-1"}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let record = state
        .backend
        .get_job(&JobRef::Id(outcome.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.artifacts, Some(json!({"messageId": "m-1"})));
}

#[actix_web::test]
async fn fail_with_retry_after_is_a_rate_limit_release() {
    let state = state().await;
    let app = app!(state);

    let outcome = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w1", state.config.lease_duration)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/fail", outcome.id))
        .set_json(json!({"worker": "w1", "error": "throttled", "retryAfterMs": 250}))
        .to_request();
    let body: routes::FailResponse = test::call_and_read_body_json(&app, req).await;
    assert!(body.ok);
    assert_eq!(body.disposition, "retry_pending");

    let record = state
        .backend
        .get_job(&JobRef::Id(outcome.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Pending, "rate limit releases to pending");
    assert_eq!(record.attempts_made, 0, "attempt handed back");
    assert!(record.scheduled_for.unwrap() > chrono::Utc::now());
}

#[actix_web::test]
async fn fail_without_retry_after_consumes_attempts() {
    let state = state().await;
    let app = app!(state);

    let outcome = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w1", state.config.lease_duration)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/fail", outcome.id))
        .set_json(json!({"worker": "w1", "error": "boom"}))
        .to_request();
    let body: routes::FailResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body.disposition, "retry_pending");
    assert!(body.retry_at.is_some());

    let record = state
        .backend
        .get_job(&JobRef::Id(outcome.id.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::RetryPending);
    assert_eq!(record.attempts_made, 1);

    // Permanent failures terminate regardless of attempts left.
    let outcome2 = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w2", state.config.lease_duration)
        .await
        .unwrap();
    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/fail", outcome2.id))
        .set_json(json!({"worker": "w2", "error": "bad", "permanent": true}))
        .to_request();
    let body: routes::FailResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body.disposition, "failed");
}

#[actix_web::test]
async fn reschedule_releases_to_the_future() {
    let state = state().await;
    let app = app!(state);

    let outcome = state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .claim("email", "w1", state.config.lease_duration)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/jobs/{}/reschedule", outcome.id))
        .set_json(json!({"worker": "w1", "delayMs": 60000}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let record = state
        .backend
        .get_job(&JobRef::Id(outcome.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert!(record.scheduled_for.unwrap() > chrono::Utc::now());
}

#[actix_web::test]
async fn stats_aggregates_by_queue() {
    let state = state().await;
    let app = app!(state);

    state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    state
        .backend
        .enqueue(request("other", json!({})))
        .await
        .unwrap();

    let req = test::TestRequest::get()
        .uri("/jobs/stats?queue=email")
        .to_request();
    let stats: QueueStats = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats.pending, 2);

    let req = test::TestRequest::get().uri("/jobs/stats").to_request();
    let stats: QueueStats = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats.pending, 3);
}

#[actix_web::test]
async fn wait_times_out_with_null_then_claims_after_enqueue() {
    let state = state().await;
    let app = app!(state);

    // Below the minimum clamp; the server holds for ~1s and returns null.
    let req = test::TestRequest::get()
        .uri("/jobs/wait?queue=email&worker=w1&timeout=10")
        .to_request();
    let started = std::time::Instant::now();
    let body: Option<JobRecord> = test::call_and_read_body_json(&app, req).await;
    assert!(body.is_none());
    assert!(started.elapsed() >= Duration::from_millis(900));

    state
        .backend
        .enqueue(request("email", json!({})))
        .await
        .unwrap();
    let req = test::TestRequest::get()
        .uri("/jobs/wait?queue=email&worker=w1&timeout=2000")
        .to_request();
    let body: Option<JobRecord> = test::call_and_read_body_json(&app, req).await;
    assert!(body.is_some(), "wait claims immediately when work is ready");
}
