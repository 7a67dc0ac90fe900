use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One named step of a job's work, with its own progress and artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    pub status: StageStatus,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
}

impl Stage {
    fn new(name: impl Into<String>) -> Stage {
        Stage {
            name: name.into(),
            status: StageStatus::Pending,
            percent: 0,
            started_at: None,
            ended_at: None,
            error: None,
            artifacts: None,
        }
    }
}

/// The ordered stage list of one job. Stages are assigned at job start and
/// may be appended, never reordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSet {
    pub stages: Vec<Stage>,
    pub current: Option<String>,
}

impl StageSet {
    pub fn init<S: Into<String>>(names: impl IntoIterator<Item = S>) -> StageSet {
        StageSet {
            stages: names.into_iter().map(Stage::new).collect(),
            current: None,
        }
    }

    pub fn from_stages(stages: Vec<Stage>, current: Option<String>) -> StageSet {
        StageSet { stages, current }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn stage_mut(&mut self, name: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Append stages at the tail. Names already present are left untouched.
    pub fn add<S: Into<String>>(&mut self, names: impl IntoIterator<Item = S>) {
        for name in names {
            let name = name.into();
            if self.get(&name).is_none() {
                self.stages.push(Stage::new(name));
            }
        }
    }

    /// Mark a stage running; the job's current stage follows it.
    pub fn start(&mut self, name: &str, now: DateTime<Utc>) -> bool {
        let found = match self.stage_mut(name) {
            Some(stage) => {
                stage.status = StageStatus::Running;
                stage.started_at.get_or_insert(now);
                true
            }
            None => false,
        };
        if found {
            self.current = Some(name.to_string());
        }
        found
    }

    pub fn update_percent(&mut self, name: &str, percent: u8) -> bool {
        match self.stage_mut(name) {
            Some(stage) => {
                stage.percent = percent.min(100);
                true
            }
            None => false,
        }
    }

    /// Complete a stage and return the artifacts that should be merged into
    /// the job-level artifact map.
    pub fn complete(
        &mut self,
        name: &str,
        artifacts: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.stage_mut(name) {
            Some(stage) => {
                stage.status = StageStatus::Completed;
                stage.percent = 100;
                stage.ended_at = Some(now);
                stage.artifacts = artifacts;
                true
            }
            None => false,
        }
    }

    /// Record a stage failure. This does not terminate the job; the handler
    /// is expected to return an error afterwards.
    pub fn fail(&mut self, name: &str, error: &str, now: DateTime<Utc>) -> bool {
        match self.stage_mut(name) {
            Some(stage) => {
                stage.status = StageStatus::Failed;
                stage.ended_at = Some(now);
                stage.error = Some(error.to_string());
                true
            }
            None => false,
        }
    }

    /// Mark whatever is still pending/running as completed. Used when a
    /// handler returns successfully without walking every stage.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        for stage in &mut self.stages {
            if matches!(stage.status, StageStatus::Pending | StageStatus::Running) {
                stage.status = StageStatus::Completed;
                stage.percent = 100;
                stage.ended_at.get_or_insert(now);
            }
        }
    }

    /// Overall progress is the arithmetic mean of the stage percentages,
    /// equally weighted.
    pub fn overall(&self) -> Option<u8> {
        if self.stages.is_empty() {
            return None;
        }
        let sum: u32 = self.stages.iter().map(|s| s.percent as u32).sum();
        Some((sum as f64 / self.stages.len() as f64).round() as u8)
    }

    /// Merged artifact map across completed stages, in stage order.
    pub fn merged_artifacts(&self) -> Option<serde_json::Value> {
        let mut merged = serde_json::Map::new();
        for stage in &self.stages {
            if let Some(serde_json::Value::Object(map)) = &stage.artifacts {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        if merged.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(merged))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_starts_all_pending() {
        let set = StageSet::init(["fetch", "convert", "tag"]);
        assert_eq!(set.stages.len(), 3);
        assert!(set
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Pending && s.percent == 0));
        assert_eq!(set.overall(), Some(0));
    }

    #[test]
    fn overall_is_mean_of_percentages() {
        let mut set = StageSet::init(["a", "b"]);
        let now = Utc::now();
        set.start("a", now);
        set.update_percent("a", 50);
        assert_eq!(set.overall(), Some(25));
        set.complete("a", None, now);
        set.start("b", now);
        set.update_percent("b", 50);
        assert_eq!(set.overall(), Some(75));
        set.complete("b", None, now);
        assert_eq!(set.overall(), Some(100));
    }

    #[test]
    fn empty_set_has_no_overall() {
        assert_eq!(StageSet::default().overall(), None);
    }

    #[test]
    fn start_tracks_current_stage() {
        let mut set = StageSet::init(["a", "b"]);
        let now = Utc::now();
        assert!(set.start("a", now));
        assert_eq!(set.current.as_deref(), Some("a"));
        assert!(set.start("b", now));
        assert_eq!(set.current.as_deref(), Some("b"));
        assert!(!set.start("missing", now));
        assert_eq!(set.current.as_deref(), Some("b"));
    }

    #[test]
    fn complete_merges_artifacts() {
        let mut set = StageSet::init(["fetch", "store"]);
        let now = Utc::now();
        set.complete("fetch", Some(json!({"bytes": 100})), now);
        set.complete("store", Some(json!({"path": "/tmp/x"})), now);
        assert_eq!(
            set.merged_artifacts(),
            Some(json!({"bytes": 100, "path": "/tmp/x"}))
        );
    }

    #[test]
    fn fail_records_error_without_removing_stage() {
        let mut set = StageSet::init(["a"]);
        let now = Utc::now();
        set.start("a", now);
        assert!(set.fail("a", "broken pipe", now));
        let stage = set.get("a").unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.error.as_deref(), Some("broken pipe"));
    }

    #[test]
    fn add_appends_without_duplicates() {
        let mut set = StageSet::init(["a"]);
        set.add(["b", "a", "c"]);
        let names: Vec<&str> = set.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn finalize_completes_remaining() {
        let mut set = StageSet::init(["a", "b"]);
        let now = Utc::now();
        set.start("a", now);
        set.complete("a", None, now);
        set.finalize(now);
        assert_eq!(set.overall(), Some(100));
        assert!(set
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Completed));
    }

    #[test]
    fn percent_clamps_to_100() {
        let mut set = StageSet::init(["a"]);
        set.update_percent("a", 150);
        assert_eq!(set.get("a").unwrap().percent, 100);
    }
}
