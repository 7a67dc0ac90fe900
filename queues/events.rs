use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Progress and lifecycle events fanned out to same-process subscribers.
/// Consumers outside the core (UI push, websockets) bridge these onto
/// whatever transport they like.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub queue: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    StageStarted { stage: String },
    StageProgress { stage: String, percent: u8 },
    StageCompleted { stage: String },
    StageFailed { stage: String, error: String },
    Progress { percent: u8 },
    Completed { artifacts: Option<serde_json::Value> },
    Failed { error: String },
}

struct EventBusInner {
    topics: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

/// In-process pub/sub keyed by topic string. Publishing to a topic nobody
/// subscribes to is a no-op; senders for dead topics are pruned lazily.
#[derive(Clone)]
pub struct EventBus(Arc<EventBusInner>);

impl EventBus {
    pub fn new() -> EventBus {
        EventBus(Arc::new(EventBusInner {
            topics: Mutex::new(HashMap::new()),
        }))
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<JobEvent> {
        let mut topics = self.0.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, topic: &str, event: JobEvent) {
        let mut topics = self.0.topics.lock().unwrap();
        if let Some(sender) = topics.get(topic) {
            if sender.send(event).is_err() {
                // Every receiver is gone; drop the topic.
                topics.remove(topic);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic for per-tenant processing events, when the job's metadata names a
/// tenant (falling back to a user id).
pub fn processing_topic(metadata: Option<&std::collections::BTreeMap<String, serde_json::Value>>) -> Option<String> {
    let metadata = metadata?;
    let id = metadata
        .get("tenantId")
        .or_else(|| metadata.get("userId"))?;
    let id = match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(format!("processing:{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent {
            job_id: "j1".into(),
            queue: "email".into(),
            at: Utc::now(),
            kind,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("processing:u1");

        bus.publish(
            "processing:u1",
            event(JobEventKind::StageStarted { stage: "fetch".into() }),
        );
        bus.publish(
            "processing:u1",
            event(JobEventKind::StageProgress { stage: "fetch".into(), percent: 40 }),
        );

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, JobEventKind::StageStarted { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.kind,
            JobEventKind::StageProgress { percent: 40, .. }
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("processing:none", event(JobEventKind::Progress { percent: 10 }));
    }

    #[test]
    fn topic_prefers_tenant_over_user() {
        let mut metadata = BTreeMap::new();
        metadata.insert("userId".to_string(), serde_json::json!("u9"));
        assert_eq!(
            processing_topic(Some(&metadata)).as_deref(),
            Some("processing:u9")
        );

        metadata.insert("tenantId".to_string(), serde_json::json!("t3"));
        assert_eq!(
            processing_topic(Some(&metadata)).as_deref(),
            Some("processing:t3")
        );

        assert_eq!(processing_topic(None), None);
        assert_eq!(processing_topic(Some(&BTreeMap::new())), None);
    }
}
