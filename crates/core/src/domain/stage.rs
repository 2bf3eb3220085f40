// Stage Domain Model
// Pure functions over a job's ordered stage list

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

/// Named sub-step of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    pub status: StageStatus,
    pub progress: i32,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Requested change to a single stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub status: StageStatus,
    pub progress: Option<i32>,
    pub error: Option<String>,
}

impl StageUpdate {
    pub fn processing(progress: i32) -> Self {
        Self {
            status: StageStatus::Processing,
            progress: Some(progress),
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: StageStatus::Completed,
            progress: Some(100),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            progress: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregate state of a stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRollup {
    /// No stages, or some stages still open
    InProgress,
    AllCompleted,
    AnyFailed,
}

/// Append stages not already present (by name). Returns how many were added.
pub fn append_stages<S: AsRef<str>>(stages: &mut Vec<Stage>, names: &[S]) -> usize {
    let mut added = 0;
    for name in names {
        let name = name.as_ref();
        if stages.iter().any(|s| s.name == name) {
            continue;
        }
        stages.push(Stage::new(name));
        added += 1;
    }
    added
}

/// Apply an update to the named stage.
///
/// `progress` is clamped to 0..=100. Entering `processing` stamps `started_at`
/// once; entering a terminal status stamps `completed_at`.
pub fn apply_stage_update(
    stages: &mut [Stage],
    name: &str,
    update: &StageUpdate,
    now_millis: i64,
) -> Result<()> {
    let stage = stages
        .iter_mut()
        .find(|s| s.name == name)
        .ok_or_else(|| DomainError::UnknownStage(name.to_string()))?;

    stage.status = update.status;
    if let Some(progress) = update.progress {
        stage.progress = progress.clamp(0, 100);
    }
    if update.error.is_some() {
        stage.error = update.error.clone();
    }

    match update.status {
        StageStatus::Processing => {
            if stage.started_at.is_none() {
                stage.started_at = Some(now_millis);
            }
        }
        StageStatus::Completed => {
            stage.progress = 100;
            stage.completed_at = Some(now_millis);
        }
        StageStatus::Failed => {
            stage.completed_at = Some(now_millis);
        }
        StageStatus::Pending => {}
    }
    Ok(())
}

/// Rounded mean of stage progress (0 when there are no stages)
pub fn overall_progress(stages: &[Stage]) -> i32 {
    if stages.is_empty() {
        return 0;
    }
    let sum: i64 = stages.iter().map(|s| s.progress as i64).sum();
    let mean = sum as f64 / stages.len() as f64;
    mean.round() as i32
}

pub fn rollup(stages: &[Stage]) -> StageRollup {
    if stages.iter().any(|s| s.status == StageStatus::Failed) {
        StageRollup::AnyFailed
    } else if !stages.is_empty() && stages.iter().all(|s| s.status == StageStatus::Completed) {
        StageRollup::AllCompleted
    } else {
        StageRollup::InProgress
    }
}

/// Force every non-terminal stage to completed
pub fn force_complete(stages: &mut [Stage], now_millis: i64) {
    for stage in stages.iter_mut().filter(|s| !s.status.is_terminal()) {
        stage.status = StageStatus::Completed;
        stage.progress = 100;
        stage.completed_at = Some(now_millis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(names: &[&str]) -> Vec<Stage> {
        let mut list = Vec::new();
        append_stages(&mut list, names);
        list
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut list = stages(&["fetch", "summarize"]);
        let added = append_stages(&mut list, &["summarize", "tag", "tag"]);

        assert_eq!(added, 1);
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fetch", "summarize", "tag"]);
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let mut list = stages(&["fetch"]);
        let err = apply_stage_update(&mut list, "missing", &StageUpdate::completed(), 1);
        assert!(matches!(err, Err(DomainError::UnknownStage(name)) if name == "missing"));
    }

    #[test]
    fn test_overall_progress_is_rounded_mean() {
        let mut list = stages(&["a", "b", "c"]);
        apply_stage_update(&mut list, "b", &StageUpdate::processing(50), 1).unwrap();
        apply_stage_update(&mut list, "c", &StageUpdate::completed(), 2).unwrap();
        assert_eq!(overall_progress(&list), 50);

        apply_stage_update(&mut list, "a", &StageUpdate::processing(1), 3).unwrap();
        // (1 + 50 + 100) / 3 = 50.33
        assert_eq!(overall_progress(&list), 50);
        assert_eq!(overall_progress(&[]), 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut list = stages(&["a"]);
        apply_stage_update(&mut list, "a", &StageUpdate::processing(180), 1).unwrap();
        assert_eq!(list[0].progress, 100);
        apply_stage_update(&mut list, "a", &StageUpdate::processing(-4), 2).unwrap();
        assert_eq!(list[0].progress, 0);
    }

    #[test]
    fn test_started_at_stamped_once() {
        let mut list = stages(&["a"]);
        apply_stage_update(&mut list, "a", &StageUpdate::processing(10), 5).unwrap();
        apply_stage_update(&mut list, "a", &StageUpdate::processing(20), 9).unwrap();
        assert_eq!(list[0].started_at, Some(5));
        assert!(list[0].completed_at.is_none());
    }

    #[test]
    fn test_rollup() {
        let mut list = stages(&["a", "b"]);
        assert_eq!(rollup(&list), StageRollup::InProgress);
        assert_eq!(rollup(&[]), StageRollup::InProgress);

        apply_stage_update(&mut list, "a", &StageUpdate::completed(), 1).unwrap();
        apply_stage_update(&mut list, "b", &StageUpdate::completed(), 2).unwrap();
        assert_eq!(rollup(&list), StageRollup::AllCompleted);

        apply_stage_update(&mut list, "b", &StageUpdate::failed("nope"), 3).unwrap();
        assert_eq!(rollup(&list), StageRollup::AnyFailed);
        assert_eq!(list[1].error.as_deref(), Some("nope"));
    }

    #[test]
    fn test_force_complete_keeps_failed_stages() {
        let mut list = stages(&["a", "b", "c"]);
        apply_stage_update(&mut list, "b", &StageUpdate::failed("x"), 1).unwrap();
        force_complete(&mut list, 2);

        assert_eq!(list[0].status, StageStatus::Completed);
        assert_eq!(list[0].progress, 100);
        assert_eq!(list[1].status, StageStatus::Failed);
        assert_eq!(list[2].completed_at, Some(2));
    }
}
