use std::sync::Arc;
use std::time::Duration;

use relay_graceful_shutdown::GracefulShutdownConsumer;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::client::Client;
use crate::config::{BackendSelector, QueueConfig};
use crate::contract::{QueueBackend, ScheduleStore};
use crate::db::{spawn_notify_bridge, PostgresBackend, SqliteBackend};
use crate::error::Error;
use crate::events::EventBus;
use crate::redis::RedisBackend;
use crate::scheduler::Scheduler;
use crate::waitlist::Waitlist;
use crate::worker::{JobHandler, Worker};

/// The one object an application creates: a storage backend plus the
/// process-local waitlist and event bus, handing out Client / Worker /
/// Scheduler views. No global state; tests build as many as they like.
pub struct QueueRuntime {
    backend: Arc<dyn QueueBackend>,
    schedules: Arc<dyn ScheduleStore>,
    waitlist: Waitlist,
    events: EventBus,
    config: QueueConfig,
    shutdown: GracefulShutdownConsumer,
}

impl QueueRuntime {
    /// Connect the backend chosen by the selector. This is the only place
    /// the backend kind is inspected; everything downstream goes through
    /// the contract traits.
    pub async fn connect(
        selector: BackendSelector,
        config: QueueConfig,
        shutdown: GracefulShutdownConsumer,
    ) -> Result<QueueRuntime, Error> {
        let waitlist = Waitlist::new();

        let (backend, schedules): (Arc<dyn QueueBackend>, Arc<dyn ScheduleStore>) = match selector
        {
            BackendSelector::Sqlite { url } => {
                event!(Level::INFO, url = %url, "Using SQLite queue backend");
                let backend = Arc::new(SqliteBackend::connect(&url, config.clone()).await?);
                (backend.clone(), backend)
            }
            BackendSelector::Postgres { url } => {
                event!(Level::INFO, "Using PostgreSQL queue backend");
                let backend =
                    Arc::new(PostgresBackend::connect(&url, 10, config.clone()).await?);
                // Cross-process enqueues reach local waiters through NOTIFY.
                let _bridge = spawn_notify_bridge(
                    backend.pool().clone(),
                    waitlist.clone(),
                    shutdown.clone(),
                );
                (backend.clone(), backend)
            }
            BackendSelector::Redis { url, key_prefix } => {
                event!(Level::INFO, "Using Redis queue backend");
                let pool = relay_database::RedisPool::new(url, key_prefix)?;
                let backend = Arc::new(RedisBackend::new(pool, config.clone()));
                (backend.clone(), backend)
            }
        };

        Ok(QueueRuntime {
            backend,
            schedules,
            waitlist,
            events: EventBus::new(),
            config,
            shutdown,
        })
    }

    /// Assemble a runtime from prebuilt parts (tests, or the HTTP remote
    /// backend which has no schedule store of its own).
    pub fn with_parts(
        backend: Arc<dyn QueueBackend>,
        schedules: Arc<dyn ScheduleStore>,
        waitlist: Waitlist,
        config: QueueConfig,
        shutdown: GracefulShutdownConsumer,
    ) -> QueueRuntime {
        QueueRuntime {
            backend,
            schedules,
            waitlist,
            events: EventBus::new(),
            config,
            shutdown,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(self.backend.clone(), self.waitlist.clone(), self.config.clone())
    }

    /// Build a worker for `queue`. Concurrency 0 means one consumer per CPU.
    pub fn worker(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Worker {
        Worker::new(
            self.backend.clone(),
            self.events.clone(),
            self.waitlist.clone(),
            self.config.clone(),
            self.shutdown.clone(),
            queue,
            handler,
            concurrency,
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.backend.clone(),
            self.schedules.clone(),
            self.waitlist.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        )
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    pub fn waitlist(&self) -> Waitlist {
        self.waitlist.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Periodic retention sweep; a no-op for backends that retain inline.
    pub fn start_retention_loop(&self, interval: Duration) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = backend.run_retention().await {
                    event!(Level::ERROR, error = %e, "Retention sweep failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => continue,
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }
        })
    }
}
