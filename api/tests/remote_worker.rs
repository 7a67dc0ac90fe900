//! The full remote plane: a transport server over a SQLite backend on an
//! ephemeral port, and a worker that only speaks HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_api::remote::connect_remote_runtime;
use relay_api::server;
use relay_graceful_shutdown::GracefulShutdownConsumer;
use relay_queues::db::SqliteBackend;
use relay_queues::{
    handler_fn, EnqueueRequest, HandlerError, JobRef, JobStatus, QueueBackend, QueueConfig,
    RetryPolicy, Waitlist,
};

fn test_config() -> QueueConfig {
    let mut config = QueueConfig::default();
    config.lease_duration = Duration::from_secs(10);
    config.poll_interval = Duration::from_millis(200);
    config.graceful_shutdown = Duration::from_secs(5);
    config.jitter_factor = 0.0;
    config.default_backoff = RetryPolicy::Fixed {
        base: Duration::from_millis(50),
    };
    config
}

fn request(queue: &str, payload: serde_json::Value, max_attempts: i32) -> EnqueueRequest {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    EnqueueRequest {
        id: format!("remote-job-{}", NEXT.fetch_add(1, Ordering::Relaxed)),
        queue: queue.to_string(),
        payload,
        idempotency_key: None,
        priority: None,
        scheduled_for: None,
        max_attempts,
        backoff: RetryPolicy::Fixed {
            base: Duration::from_millis(50),
        },
        stages: Vec::new(),
        metadata: None,
        replace_if_not_active: false,
    }
}

async fn start_server(
    config: QueueConfig,
) -> (Arc<SqliteBackend>, Waitlist, String) {
    let backend = Arc::new(
        SqliteBackend::connect("sqlite::memory:", config.clone())
            .await
            .expect("sqlite backend"),
    );
    let waitlist = Waitlist::new();

    let (srv, address, port) = server::start(
        server::Config {
            bind_address: None,
            bind_port: 0,
        },
        backend.clone(),
        waitlist.clone(),
        config,
    )
    .expect("binding transport server");

    actix_web::rt::spawn(srv);

    (backend, waitlist, format!("http://{}:{}", address, port))
}

async fn wait_for_status(
    backend: &Arc<SqliteBackend>,
    id: &str,
    status: JobStatus,
) -> relay_queues::JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = backend
            .get_job(&JobRef::Id(id.to_string()))
            .await
            .expect("get_job")
        {
            if record.status == status {
                return record;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {} did not reach {:?} in time", id, status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[actix_web::test]
async fn remote_worker_completes_jobs_over_http() {
    let config = test_config();
    let (backend, waitlist, base_url) = start_server(config.clone()).await;

    let runtime = connect_remote_runtime(&base_url, config, GracefulShutdownConsumer::noop());
    let handler = handler_fn(|ctx: relay_queues::JobContext| async move {
        ctx.log("remote handler running");
        Ok(Some(json!({"handled": true})))
    });
    let worker = runtime.worker("remote", handler, 1);
    worker.start();

    let outcome = backend
        .enqueue(request("remote", json!({"n": 1}), 3))
        .await
        .unwrap();
    // The server-side waitlist is what /wait parks on.
    waitlist.notify("remote");

    let record = wait_for_status(&backend, &outcome.id, JobStatus::Completed).await;
    assert_eq!(record.attempts_made, 1);
    assert_eq!(record.artifacts, Some(json!({"handled": true})));

    worker.stop().await;
}

#[actix_web::test]
async fn remote_worker_retries_until_attempts_are_exhausted() {
    let config = test_config();
    let (backend, waitlist, base_url) = start_server(config.clone()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::retryable(anyhow::anyhow!("still broken")))
        }
    });

    let runtime = connect_remote_runtime(&base_url, config, GracefulShutdownConsumer::noop());
    let worker = runtime.worker("remote-fail", handler, 1);
    worker.start();

    let outcome = backend
        .enqueue(request("remote-fail", json!({}), 2))
        .await
        .unwrap();
    waitlist.notify("remote-fail");

    let record = wait_for_status(&backend, &outcome.id, JobStatus::Failed).await;
    assert_eq!(record.attempts_made, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        record.last_error.expect("failure recorded").kind,
        "retryable"
    );

    worker.stop().await;
}

#[actix_web::test]
async fn remote_rate_limit_hands_the_attempt_back() {
    let config = test_config();
    let (backend, waitlist, base_url) = start_server(config.clone()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let seen = seen.clone();
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HandlerError::rate_limit(Duration::from_millis(150)))
            } else {
                Ok(None)
            }
        }
    });

    let runtime = connect_remote_runtime(&base_url, config, GracefulShutdownConsumer::noop());
    let worker = runtime.worker("remote-throttle", handler, 1);
    worker.start();

    let outcome = backend
        .enqueue(request("remote-throttle", json!({}), 3))
        .await
        .unwrap();
    waitlist.notify("remote-throttle");

    let record = wait_for_status(&backend, &outcome.id, JobStatus::Completed).await;
    assert_eq!(record.attempts_made, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    worker.stop().await;
}
