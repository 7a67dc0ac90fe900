use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{event, Level};

/// In-process rendezvous between the enqueue path and long-polling workers.
/// Purely advisory: a woken waiter races the claim query and may find
/// nothing. Never coordinates across processes.
#[derive(Clone)]
pub struct Waitlist(Arc<WaitlistInner>);

struct WaitlistInner {
    queues: Mutex<HashMap<String, QueueWaiters>>,
    next_waiter_id: AtomicU64,
}

#[derive(Default)]
struct QueueWaiters {
    waiters: VecDeque<Waiter>,
    /// Earliest armed wakeup for future-scheduled work, with a generation
    /// counter so a superseded timer task notices and does nothing.
    next_wake: Option<DateTime<Utc>>,
    generation: u64,
}

struct Waiter {
    id: u64,
    worker: String,
    tx: oneshot::Sender<()>,
}

impl Waitlist {
    pub fn new() -> Waitlist {
        Waitlist(Arc::new(WaitlistInner {
            queues: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(1),
        }))
    }

    /// Block until an enqueue (or armed timer) wakes this worker, or until
    /// `timeout` elapses. Returns true when woken by a notification.
    pub async fn wait(&self, queue: &str, worker: &str, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let id = self.0.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut queues = self.0.queues.lock().unwrap();
            queues
                .entry(queue.to_string())
                .or_default()
                .waiters
                .push_back(Waiter {
                    id,
                    worker: worker.to_string(),
                    tx,
                });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                // Timed out or the notifier side dropped us; deregister.
                let mut queues = self.0.queues.lock().unwrap();
                if let Some(entry) = queues.get_mut(queue) {
                    entry.waiters.retain(|w| w.id != id);
                }
                false
            }
        }
    }

    /// Resolve the oldest waiter for this queue, if any.
    pub fn notify(&self, queue: &str) {
        let mut queues = self.0.queues.lock().unwrap();
        if let Some(entry) = queues.get_mut(queue) {
            Self::wake_one(entry, queue);
        }
    }

    /// Arm a wakeup at `at` for future-scheduled work. The earliest armed
    /// time wins; re-arming later than the current timer is a no-op.
    pub fn arm(&self, queue: &str, at: DateTime<Utc>) {
        let now = Utc::now();
        if at <= now {
            self.notify(queue);
            return;
        }

        let generation = {
            let mut queues = self.0.queues.lock().unwrap();
            let entry = queues.entry(queue.to_string()).or_default();
            match entry.next_wake {
                Some(existing) if existing <= at => return,
                _ => {}
            }
            entry.next_wake = Some(at);
            entry.generation += 1;
            entry.generation
        };

        let list = self.clone();
        let queue = queue.to_string();
        let sleep_for = (at - now)
            .to_std()
            .unwrap_or_else(|_| Duration::from_millis(0));
        tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;
            let mut queues = list.0.queues.lock().unwrap();
            if let Some(entry) = queues.get_mut(&queue) {
                if entry.generation != generation {
                    // A nearer wakeup replaced this timer.
                    return;
                }
                entry.next_wake = None;
                Self::wake_one(entry, &queue);
            }
        });
    }

    fn wake_one(entry: &mut QueueWaiters, queue: &str) {
        while let Some(waiter) = entry.waiters.pop_front() {
            let worker = waiter.worker;
            if waiter.tx.send(()).is_ok() {
                event!(Level::DEBUG, queue, worker = %worker, "Woke queue waiter");
                return;
            }
            // Receiver gave up (timeout raced the send); try the next one.
        }
    }

    #[cfg(test)]
    fn waiter_count(&self, queue: &str) -> usize {
        self.0
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|e| e.waiters.len())
            .unwrap_or(0)
    }
}

impl Default for Waitlist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_oldest_waiter_first() {
        let list = Waitlist::new();

        let l1 = list.clone();
        let first = tokio::spawn(async move { l1.wait("q", "w1", Duration::from_secs(5)).await });
        // Make sure w1 registers before w2.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let l2 = list.clone();
        let second = tokio::spawn(async move { l2.wait("q", "w2", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        list.notify("q");
        assert!(first.await.unwrap(), "first waiter should be woken");
        assert_eq!(list.waiter_count("q"), 1, "second waiter still parked");

        list.notify("q");
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_and_deregisters() {
        let list = Waitlist::new();
        let woken = list.wait("q", "w1", Duration::from_millis(25)).await;
        assert!(!woken);
        assert_eq!(list.waiter_count("q"), 0);
    }

    #[tokio::test]
    async fn notify_without_waiters_is_noop() {
        let list = Waitlist::new();
        list.notify("empty");
    }

    #[tokio::test]
    async fn armed_timer_wakes_a_waiter() {
        let list = Waitlist::new();
        let at = Utc::now() + chrono::Duration::milliseconds(50);
        list.arm("q", at);

        let woken = list.wait("q", "w1", Duration::from_secs(5)).await;
        assert!(woken, "armed timer should wake the waiter");
    }

    #[tokio::test]
    async fn arm_in_past_notifies_immediately() {
        let list = Waitlist::new();
        let l1 = list.clone();
        let waiter = tokio::spawn(async move { l1.wait("q", "w1", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        list.arm("q", Utc::now() - chrono::Duration::seconds(1));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn earliest_armed_time_wins() {
        let list = Waitlist::new();
        let far = Utc::now() + chrono::Duration::seconds(30);
        let near = Utc::now() + chrono::Duration::milliseconds(40);
        list.arm("q", far);
        list.arm("q", near);

        let started = std::time::Instant::now();
        let woken = list.wait("q", "w1", Duration::from_secs(5)).await;
        assert!(woken);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "nearer timer should fire"
        );
    }
}
