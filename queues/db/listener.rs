use std::time::Duration;

use futures::future::TryFutureExt;
use relay_database::PostgresPool;
use relay_graceful_shutdown::GracefulShutdownConsumer;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use super::postgres::NOTIFY_CHANNEL;
use crate::waitlist::Waitlist;

/// Bridge Postgres NOTIFY into the in-process waitlist, so an enqueue in
/// another process wakes local long-pollers without a poll cycle. The
/// notification payload is the queue name.
pub fn spawn_notify_bridge(
    pool: PostgresPool,
    waitlist: Waitlist,
    mut shutdown: GracefulShutdownConsumer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener: Option<PgListener> = None;

        loop {
            if listener.is_none() {
                let created = PgListener::connect_with(&pool)
                    .and_then(|mut l| async move {
                        l.listen(NOTIFY_CHANNEL).await?;
                        Ok(l)
                    })
                    .await;

                match created {
                    Ok(l) => {
                        event!(
                            Level::DEBUG,
                            channel = NOTIFY_CHANNEL,
                            "Queue notify listener ready"
                        );
                        listener = Some(l);
                    }
                    Err(e) => {
                        event!(Level::ERROR, error = %e, "Error creating queue notify listener");
                        // Try again after a pause, unless we're going down.
                        tokio::select! {
                            biased;

                            _ = shutdown.wait_for_shutdown() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                        continue;
                    }
                }
            }

            let active = match listener.as_mut() {
                Some(l) => l,
                None => continue,
            };

            tokio::select! {
                biased;

                _ = shutdown.wait_for_shutdown() => break,
                notify = active.try_recv() => {
                    match notify {
                        Ok(Some(notification)) => {
                            waitlist.notify(notification.payload());
                        }
                        Ok(None) => {
                            // Connection died; rebuild it before waiting again.
                            listener = None;
                        }
                        Err(e) => {
                            event!(Level::ERROR, error = %e, "Error receiving queue notify");
                            listener = None;
                        }
                    };
                }
            }
        }

        event!(Level::DEBUG, "Queue notify listener stopped");
    })
}
