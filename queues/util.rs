use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Generate a fresh job id.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Process-lifetime worker identity: prefix, pid, and a random suffix so
/// that two workers on one host never collide.
pub fn worker_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, std::process::id(), &suffix[..8])
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(delay.as_millis() as i64)
}

/// Stop signal for a worker's consumer tasks and the contexts they hand to
/// handlers. Same watch-channel shape as the process shutdown consumer, but
/// scoped to one worker.
#[derive(Clone, Debug)]
pub struct StopSignal(watch::Receiver<bool>);

#[derive(Debug)]
pub struct StopSource(watch::Sender<bool>);

pub fn stop_channel() -> (StopSource, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopSource(tx), StopSignal(rx))
}

impl StopSource {
    pub fn stop(&self) {
        self.0.send(true).ok();
    }
}

impl StopSignal {
    pub fn stopping(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait(&mut self) {
        loop {
            match self.0.changed().await {
                Ok(_) => {
                    if *self.0.borrow() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Sleep that wakes early when the signal fires. Returns false when the
/// sleep was interrupted by the stop signal.
pub async fn cancellable_sleep(duration: Duration, stop: &mut StopSignal) -> bool {
    tokio::select! {
        biased;

        _ = stop.wait() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_unique_and_prefixed() {
        let a = worker_id("relay");
        let b = worker_id("relay");
        assert!(a.starts_with("relay-"));
        assert_ne!(a, b);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let (source, mut signal) = stop_channel();
        let waiter = tokio::spawn(async move {
            cancellable_sleep(Duration::from_secs(30), &mut signal).await
        });
        tokio::task::yield_now().await;
        source.stop();
        let completed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel should be quick")
            .expect("no panic");
        assert!(!completed, "sleep should report interruption");
    }

    #[tokio::test]
    async fn sleep_completes_when_not_stopped() {
        let (_source, mut signal) = stop_channel();
        assert!(cancellable_sleep(Duration::from_millis(5), &mut signal).await);
    }
}
