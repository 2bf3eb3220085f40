// Stage/Progress Tracker
//
// Stage mutations read-modify-write the whole stage list. A tracker bound to
// a worker (`owned_by`) only writes while that worker holds the job's lease,
// so a superseded attempt gets `LeaseLost` instead of overwriting the row.

use crate::domain::stage::{self, StageRollup, StageStatus, StageUpdate};
use crate::domain::{Job, JobEvent, JobEventKind, JobId, JobStatus};
use crate::error::{AppError, Result};
use crate::port::{EventPublisher, JobStore, ProgressUpdate, TimeProvider};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StageTracker {
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventPublisher>,
    time: Arc<dyn TimeProvider>,
    /// Worker whose lease guards every write; None for operator use
    lease_owner: Option<String>,
}

impl StageTracker {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<dyn EventPublisher>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            events,
            time,
            lease_owner: None,
        }
    }

    /// Tracker for one attempt: writes require `worker_id` to hold the lease
    pub fn owned_by(&self, worker_id: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            time: Arc::clone(&self.time),
            lease_owner: Some(worker_id.into()),
        }
    }

    pub fn lease_owner(&self) -> Option<&str> {
        self.lease_owner.as_deref()
    }

    fn missing(&self, job_id: &JobId) -> AppError {
        match &self.lease_owner {
            Some(owner) => {
                warn!(job_id = %job_id, worker_id = %owner, "Lease lost, stage write discarded");
                AppError::LeaseLost(job_id.clone())
            }
            None => AppError::NotFound(format!("Job {} not found", job_id)),
        }
    }

    async fn load(&self, job_id: &JobId) -> Result<Job> {
        let job = self.store.find_by_id(job_id).await?;
        match (job, self.lease_owner.as_deref()) {
            (Some(job), Some(owner)) if !job.is_leased_by(owner) => Err(self.missing(job_id)),
            (Some(job), _) => Ok(job),
            (None, _) => Err(self.missing(job_id)),
        }
    }

    async fn save(&self, job_id: &JobId, update: ProgressUpdate) -> Result<Job> {
        self.store
            .save_progress(job_id, self.lease_owner.as_deref(), &update)
            .await?
            .ok_or_else(|| self.missing(job_id))
    }

    /// Replace the stage list with `names`, all pending
    pub async fn initialize_job(&self, job_id: &JobId, names: &[&str]) -> Result<Job> {
        let mut stages = Vec::new();
        stage::append_stages(&mut stages, names);

        let job = self
            .save(
                job_id,
                ProgressUpdate {
                    stages,
                    overall_progress: 0,
                    current_stage: None,
                    status: None,
                    error_message: None,
                    completed_at: None,
                },
            )
            .await?;

        debug!(job_id = %job_id, stages = names.len(), "Stages initialized");
        self.emit(JobEventKind::JobUpdate, &job).await;
        Ok(job)
    }

    /// Append stages not already present. No write when nothing is new.
    pub async fn add_stages(&self, job_id: &JobId, names: &[&str]) -> Result<Job> {
        let mut job = self.load(job_id).await?;
        let added = stage::append_stages(&mut job.stages, names);
        if added == 0 {
            return Ok(job);
        }

        let overall_progress = stage::overall_progress(&job.stages);
        let job = self
            .save(
                job_id,
                ProgressUpdate {
                    stages: job.stages,
                    overall_progress,
                    current_stage: job.current_stage,
                    status: None,
                    error_message: None,
                    completed_at: None,
                },
            )
            .await?;

        self.emit(JobEventKind::JobUpdate, &job).await;
        Ok(job)
    }

    /// Update one stage and roll the result up into the job.
    ///
    /// All stages completed: job completed with progress 100. Any stage failed:
    /// job failed with that stage's error. Otherwise progress is the rounded
    /// mean of stage progress.
    pub async fn update_stage(
        &self,
        job_id: &JobId,
        name: &str,
        update: StageUpdate,
    ) -> Result<Job> {
        let now = self.time.now_millis();
        let mut job = self.load(job_id).await?;
        stage::apply_stage_update(&mut job.stages, name, &update, now)?;

        let mut progress = ProgressUpdate {
            overall_progress: stage::overall_progress(&job.stages),
            current_stage: Some(name.to_string()),
            status: None,
            error_message: None,
            completed_at: None,
            stages: Vec::new(),
        };

        let kind = match stage::rollup(&job.stages) {
            StageRollup::AllCompleted => {
                stage::force_complete(&mut job.stages, now);
                progress.overall_progress = 100;
                progress.status = Some(JobStatus::Completed);
                progress.completed_at = Some(now);
                JobEventKind::JobCompleted
            }
            StageRollup::AnyFailed => {
                progress.status = Some(JobStatus::Failed);
                progress.error_message = update
                    .error
                    .clone()
                    .or_else(|| Some(format!("Stage {} failed", name)));
                JobEventKind::JobFailed
            }
            StageRollup::InProgress => JobEventKind::StageUpdate,
        };
        progress.stages = job.stages;

        let job = self.save(job_id, progress).await?;
        let mut event = self.event_for(kind, &job).await;
        event.stage = Some(name.to_string());
        self.events.publish(&job.user_id, event);
        Ok(job)
    }

    /// Live progress event only; nothing is persisted
    pub fn update_progress(&self, job: &Job, stage: &str, progress: i32) {
        let event = JobEvent {
            kind: JobEventKind::StageUpdate,
            job_id: job.id.clone(),
            asset_type: job.queue.clone(),
            asset_id: job.asset_id.clone(),
            status: JobStatus::Processing,
            stage: Some(stage.to_string()),
            progress: progress.clamp(0, 100),
            error: None,
            timestamp: self.time.now_millis(),
            job: None,
            summary: None,
        };
        self.events.publish(&job.user_id, event);
    }

    pub async fn start_stage(&self, job_id: &JobId, name: &str) -> Result<Job> {
        self.update_stage(job_id, name, StageUpdate::processing(0))
            .await
    }

    pub async fn complete_stage(&self, job_id: &JobId, name: &str) -> Result<Job> {
        self.update_stage(job_id, name, StageUpdate::completed())
            .await
    }

    pub async fn fail_stage(&self, job_id: &JobId, name: &str, error: &str) -> Result<Job> {
        self.update_stage(job_id, name, StageUpdate::failed(error))
            .await
    }

    /// Force completion: every open stage completed, progress 100
    pub async fn complete_job(&self, job_id: &JobId) -> Result<Job> {
        let now = self.time.now_millis();
        let mut job = self.load(job_id).await?;
        stage::force_complete(&mut job.stages, now);

        let job = self
            .save(
                job_id,
                ProgressUpdate {
                    stages: job.stages,
                    overall_progress: 100,
                    current_stage: job.current_stage,
                    status: Some(JobStatus::Completed),
                    error_message: None,
                    completed_at: Some(now),
                },
            )
            .await?;

        self.emit(JobEventKind::JobCompleted, &job).await;
        Ok(job)
    }

    /// Mark the job failed; the stage in progress (if any) fails with it
    pub async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<Job> {
        let now = self.time.now_millis();
        let mut job = self.load(job_id).await?;

        let in_progress: Vec<String> = job
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Processing)
            .map(|s| s.name.clone())
            .collect();
        for name in &in_progress {
            stage::apply_stage_update(&mut job.stages, name, &StageUpdate::failed(error), now)?;
        }

        let overall_progress = stage::overall_progress(&job.stages);
        let job = self
            .save(
                job_id,
                ProgressUpdate {
                    stages: job.stages,
                    overall_progress,
                    current_stage: job.current_stage,
                    status: Some(JobStatus::Failed),
                    error_message: Some(error.to_string()),
                    completed_at: None,
                },
            )
            .await?;

        self.emit(JobEventKind::JobFailed, &job).await;
        Ok(job)
    }

    async fn event_for(&self, kind: JobEventKind, job: &Job) -> JobEvent {
        let event = JobEvent::from_job(kind, job, self.time.now_millis());
        match self.store.status_counts(&job.user_id).await {
            Ok(summary) => event.with_summary(summary),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to compute job summary");
                event
            }
        }
    }

    /// Publish a durable-state event with the user's summary attached
    pub async fn emit(&self, kind: JobEventKind, job: &Job) {
        let event = self.event_for(kind, job).await;
        self.events.publish(&job.user_id, event);
    }
}
