use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{event, Level};

use crate::contract::{ProgressUpdate, QueueBackend};
use crate::error::Error;
use crate::events::{processing_topic, EventBus, JobEvent, JobEventKind};
use crate::job::JobRecord;
use crate::stage::StageSet;
use crate::util::StopSignal;

struct ContextInner {
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
    job: JobRecord,
    worker: String,
    lease: Duration,
    topic: Option<String>,
    stages: Mutex<StageSet>,
    artifacts: Mutex<serde_json::Map<String, serde_json::Value>>,
    stop: StopSignal,
}

/// Handler-facing surface for one claimed job. Cheap to clone; all stage
/// mutations are persisted under the worker's lease and fanned out on the
/// event bus.
#[derive(Clone)]
pub struct JobContext(Arc<ContextInner>);

impl JobContext {
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        events: EventBus,
        job: JobRecord,
        worker: String,
        lease: Duration,
        stop: StopSignal,
    ) -> JobContext {
        let topic = processing_topic(job.metadata.as_ref());
        let stages = StageSet::from_stages(job.stages.clone(), job.current_stage.clone());
        let artifacts = match &job.artifacts {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        JobContext(Arc::new(ContextInner {
            backend,
            events,
            job,
            worker,
            lease,
            topic,
            stages: Mutex::new(stages),
            artifacts: Mutex::new(artifacts),
            stop,
        }))
    }

    /// Read-only snapshot of the job as it was claimed.
    pub fn job(&self) -> &JobRecord {
        &self.0.job
    }

    /// Signal that fires when the worker is stopping. Handlers are expected
    /// to cooperate; they are never forcibly killed.
    pub fn cancellation(&self) -> StopSignal {
        self.0.stop.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.stop.stopping()
    }

    /// Structured log line enriched with the job's identity.
    pub fn log(&self, msg: &str) {
        event!(
            Level::INFO,
            job = %self.0.job.id,
            queue = %self.0.job.queue,
            worker = %self.0.worker,
            "{}",
            msg
        );
    }

    /// Force-extend the lease. Returns false when the job is no longer
    /// owned; the caller should wind down, the queue will reclaim.
    pub async fn heartbeat(&self) -> Result<bool, Error> {
        self.0
            .backend
            .heartbeat(&self.0.job.id, &self.0.worker, self.0.lease)
            .await
    }

    /// Numeric-only progress for jobs that do not use stages.
    pub async fn progress(&self, percent: u8) -> Result<(), Error> {
        let percent = percent.min(100);
        let update = ProgressUpdate {
            stages: None,
            current_stage: None,
            overall_progress: Some(percent),
            artifacts: None,
        };
        self.persist(update).await;
        self.publish(JobEventKind::Progress { percent });
        Ok(())
    }

    /// Assign the ordered stage list, all pending at 0%.
    pub async fn init_stages<S: Into<String>>(
        &self,
        names: impl IntoIterator<Item = S>,
    ) -> Result<(), Error> {
        {
            let mut stages = self.0.stages.lock().unwrap();
            *stages = StageSet::init(names);
        }
        self.persist_stages(None).await;
        Ok(())
    }

    /// Append stages at the tail. Existing names are left untouched.
    pub async fn add_stages<S: Into<String>>(
        &self,
        names: impl IntoIterator<Item = S>,
    ) -> Result<(), Error> {
        {
            let mut stages = self.0.stages.lock().unwrap();
            stages.add(names);
        }
        self.persist_stages(None).await;
        Ok(())
    }

    pub async fn start_stage(&self, name: &str) -> Result<(), Error> {
        let found = {
            let mut stages = self.0.stages.lock().unwrap();
            stages.start(name, Utc::now())
        };
        if !found {
            return Err(Error::Validation(format!("unknown stage {}", name)));
        }
        self.persist_stages(None).await;
        self.publish(JobEventKind::StageStarted { stage: name.to_string() });
        Ok(())
    }

    pub async fn update_stage_progress(&self, name: &str, percent: u8) -> Result<(), Error> {
        let percent = percent.min(100);
        let found = {
            let mut stages = self.0.stages.lock().unwrap();
            stages.update_percent(name, percent)
        };
        if !found {
            return Err(Error::Validation(format!("unknown stage {}", name)));
        }
        self.persist_stages(None).await;
        self.publish(JobEventKind::StageProgress { stage: name.to_string(), percent });
        Ok(())
    }

    /// Complete a stage, merging its artifacts into the job-level map.
    pub async fn complete_stage(
        &self,
        name: &str,
        artifacts: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let found = {
            let mut stages = self.0.stages.lock().unwrap();
            stages.complete(name, artifacts.clone(), Utc::now())
        };
        if !found {
            return Err(Error::Validation(format!("unknown stage {}", name)));
        }

        let merged = {
            let mut job_artifacts = self.0.artifacts.lock().unwrap();
            if let Some(serde_json::Value::Object(map)) = artifacts {
                for (k, v) in map {
                    job_artifacts.insert(k, v);
                }
            }
            serde_json::Value::Object(job_artifacts.clone())
        };

        self.persist_stages(Some(merged)).await;
        self.publish(JobEventKind::StageCompleted { stage: name.to_string() });
        Ok(())
    }

    /// Record a stage failure. The job itself keeps running; a handler that
    /// cannot continue returns an error afterwards.
    pub async fn fail_stage(&self, name: &str, error: &str) -> Result<(), Error> {
        let found = {
            let mut stages = self.0.stages.lock().unwrap();
            stages.fail(name, error, Utc::now())
        };
        if !found {
            return Err(Error::Validation(format!("unknown stage {}", name)));
        }
        self.persist_stages(None).await;
        self.publish(JobEventKind::StageFailed {
            stage: name.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// The final stage/artifact state, consumed by the worker when it
    /// reports the outcome.
    pub(crate) fn final_state(
        &self,
    ) -> (StageSet, Option<serde_json::Value>) {
        let stages = self.0.stages.lock().unwrap().clone();
        let artifacts = self.0.artifacts.lock().unwrap();
        let artifacts = if artifacts.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(artifacts.clone()))
        };
        (stages, artifacts)
    }

    pub(crate) fn publish_outcome(&self, kind: JobEventKind) {
        self.publish(kind);
    }

    async fn persist_stages(&self, artifacts: Option<serde_json::Value>) {
        let (stages, current, overall) = {
            let stages = self.0.stages.lock().unwrap();
            (stages.stages.clone(), stages.current.clone(), stages.overall())
        };
        let update = ProgressUpdate {
            stages: Some(stages),
            current_stage: current,
            overall_progress: overall,
            artifacts,
        };
        self.persist(update).await;
    }

    /// A progress write that loses the ownership race is logged and
    /// swallowed, same as a failed heartbeat: the job will be reclaimed and
    /// the next attempt starts from the claim-time state.
    async fn persist(&self, update: ProgressUpdate) {
        match self
            .0
            .backend
            .update_progress(&self.0.job.id, &self.0.worker, update)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                event!(
                    Level::WARN,
                    job = %self.0.job.id,
                    worker = %self.0.worker,
                    "Progress write skipped; lease no longer held"
                );
            }
            Err(e) => {
                event!(
                    Level::WARN,
                    job = %self.0.job.id,
                    error = %e,
                    "Progress write failed"
                );
            }
        }
    }

    fn publish(&self, kind: JobEventKind) {
        if let Some(topic) = &self.0.topic {
            self.0.events.publish(
                topic,
                JobEvent {
                    job_id: self.0.job.id.clone(),
                    queue: self.0.job.queue.clone(),
                    at: Utc::now(),
                    kind,
                },
            );
        }
    }
}
