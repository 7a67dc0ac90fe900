use std::time::Duration;

use tokio::select;
use tokio::signal::ctrl_c;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Owner side of the process shutdown signal. Dropping it, calling
/// [`GracefulShutdown::shutdown`], or a SIGINT all move every consumer to the
/// shutting-down state.
#[derive(Debug)]
pub struct GracefulShutdown {
    pub shutdown_finished: JoinHandle<()>,

    start_shutdown: Option<oneshot::Sender<()>>,
    consumer: GracefulShutdownConsumer,
}

/// Cloneable handle that long-lived tasks hold to learn about shutdown.
#[derive(Clone, Debug)]
pub struct GracefulShutdownConsumer(watch::Receiver<bool>);

impl GracefulShutdown {
    pub fn new() -> GracefulShutdown {
        // Flips to true exactly once, when shutdown starts.
        let (shutdown_started_tx, shutdown_started_rx) = watch::channel(false);

        // Send a value or drop this channel to start shutting down.
        let (start_shutdown_tx, start_shutdown_rx) = oneshot::channel();

        let shutdown_waiter = tokio::spawn(async move {
            select! {
                _ = ctrl_c() => {},
                _ = start_shutdown_rx => {},
            };

            // Consumers learn about shutdown either from the value change or
            // from this sender dropping when the task exits.
            shutdown_started_tx.send(true).ok();
        });

        GracefulShutdown {
            start_shutdown: Some(start_shutdown_tx),
            shutdown_finished: shutdown_waiter,
            consumer: GracefulShutdownConsumer(shutdown_started_rx),
        }
    }

    pub fn consumer(&self) -> GracefulShutdownConsumer {
        self.consumer.clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(sender) = self.start_shutdown.take() {
            sender.send(()).ok();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdownConsumer {
    /// A consumer that is never told to shut down. Useful in tests and for
    /// short-lived tools that do not install a signal handler.
    pub fn noop() -> GracefulShutdownConsumer {
        let (tx, rx) = watch::channel(false);
        // The channel must stay open for the process lifetime.
        std::mem::forget(tx);
        GracefulShutdownConsumer(rx)
    }

    pub fn shutting_down(&mut self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait_for_shutdown(&mut self) {
        loop {
            match self.0.changed().await {
                Ok(_) => {
                    if *self.0.borrow() {
                        return;
                    }
                }
                // Sender closed, which also means we are shutting down.
                Err(_) => return,
            }
        }
    }

    /// Wait for `task` to finish, but give up once `grace` has elapsed. The
    /// task keeps running if the deadline hits; the caller decides whether to
    /// abort it.
    pub async fn drain<T>(
        &mut self,
        task: JoinHandle<T>,
        grace: Duration,
    ) -> Result<T, DrainTimeout<T>> {
        let mut task = task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_join_err)) => Err(DrainTimeout::Panicked),
            Err(_elapsed) => Err(DrainTimeout::TimedOut(task)),
        }
    }
}

/// Outcome of a bounded drain that did not produce the task's value.
#[derive(Debug)]
pub enum DrainTimeout<T> {
    /// Grace period elapsed; the original handle is returned so the caller
    /// can abort or keep waiting.
    TimedOut(JoinHandle<T>),
    Panicked,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;
    use libc::{getpid, kill, SIGINT};
    use tokio::{sync::oneshot::error::TryRecvError, time::timeout};

    /// Send a SIGINT to the current process
    fn send_sigint() {
        unsafe {
            kill(getpid(), SIGINT);
        }
    }

    #[tokio::test]
    async fn consumer_must_be_send_and_sync() {
        fn takes_a_sync<T: Send + Sync>(_value: T) {}

        let gs = GracefulShutdown::new();
        takes_a_sync(gs.consumer());
    }

    #[tokio::test]
    async fn handle_sigint() {
        let s = GracefulShutdown::new();

        let mut done_consumer = s.consumer();
        assert!(!done_consumer.shutting_down());
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let done_task = tokio::spawn(async move {
            done_consumer.wait_for_shutdown().await;
            done_tx.send(()).unwrap();
        });

        assert_eq!(done_rx.try_recv(), Err(TryRecvError::Empty));

        let mut before_consumer = s.consumer();
        assert!(!before_consumer.shutting_down());

        // Let the waiter task start before sending the signal.
        tokio::task::yield_now().await;

        send_sigint();

        match timeout(Duration::from_secs(2), done_task).await {
            Ok(Ok(())) => {}
            x => panic!("Done waiter failed to stop: {:?}", x),
        };

        assert!(before_consumer.shutting_down());

        // Consumers created after the SIGINT should observe it too.
        let mut after_consumer = s.consumer();
        assert!(after_consumer.shutting_down());

        match timeout(Duration::from_secs(2), after_consumer.wait_for_shutdown()).await {
            Ok(()) => {}
            x => panic!("Waiter created after SIGINT did not resolve: {:?}", x),
        };

        match timeout(Duration::from_secs(2), s.shutdown_finished).await {
            Ok(Ok(())) => {}
            x => panic!("Shutdown task did not quit after SIGINT: {:?}", x),
        };
    }

    #[tokio::test]
    async fn handle_manual_shutdown() {
        let mut s = GracefulShutdown::new();

        let mut done_consumer = s.consumer();
        assert!(!done_consumer.shutting_down());
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let done_task = tokio::spawn(async move {
            done_consumer.wait_for_shutdown().await;
            done_tx.send(()).unwrap();
        });

        assert_eq!(done_rx.try_recv(), Err(TryRecvError::Empty));

        s.shutdown();

        match timeout(Duration::from_secs(2), done_task).await {
            Ok(Ok(())) => {}
            x => panic!("Done waiter failed to stop: {:?}", x),
        };

        let mut after_consumer = s.consumer();
        assert!(after_consumer.shutting_down());
    }

    #[tokio::test]
    async fn drain_returns_value_before_deadline() {
        let mut consumer = GracefulShutdownConsumer::noop();
        let task = tokio::spawn(async { 17u32 });
        let value = consumer
            .drain(task, Duration::from_secs(2))
            .await
            .expect("drain should finish");
        assert_eq!(value, 17);
    }

    #[tokio::test]
    async fn drain_times_out_and_returns_handle() {
        let mut consumer = GracefulShutdownConsumer::noop();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let result = consumer.drain(task, Duration::from_millis(20)).await;
        match result {
            Err(DrainTimeout::TimedOut(handle)) => handle.abort(),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn noop_consumer_never_fires() {
        let mut consumer = GracefulShutdownConsumer::noop();
        assert!(!consumer.shutting_down());
        let fired = timeout(Duration::from_millis(20), consumer.wait_for_shutdown()).await;
        assert_matches!(fired, Err(_));
    }
}
