// Job Event Domain Model
// Events are addressed to the job's owning user and consumed by push channels

use crate::domain::job::{Job, JobStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobCreated,
    JobUpdate,
    StageUpdate,
    JobCompleted,
    JobFailed,
}

/// Per-user job counts, attached to durable events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry_pending: i64,
}

impl JobSummary {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.retry_pending
    }

    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::RetryPending => self.retry_pending += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: JobEventKind,
    pub job_id: String,
    /// Queue the job belongs to
    pub asset_type: String,
    pub asset_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
    /// Full job snapshot (absent on fast-path progress events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Box<Job>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<JobSummary>,
}

impl JobEvent {
    /// Event describing the job's current durable state
    pub fn from_job(kind: JobEventKind, job: &Job, now_millis: i64) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            asset_type: job.queue.clone(),
            asset_id: job.asset_id.clone(),
            status: job.status,
            stage: job.current_stage.clone(),
            progress: job.overall_progress,
            error: job.error_message.clone(),
            timestamp: now_millis,
            job: Some(Box::new(job.clone())),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: JobSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    /// Kind matching a terminal/non-terminal job status
    pub fn kind_for_status(status: JobStatus) -> JobEventKind {
        match status {
            JobStatus::Completed => JobEventKind::JobCompleted,
            JobStatus::Failed => JobEventKind::JobFailed,
            _ => JobEventKind::JobUpdate,
        }
    }
}

/// Event routed to a single user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    pub user_id: String,
    pub event: JobEvent,
}
