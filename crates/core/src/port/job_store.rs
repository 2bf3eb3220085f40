// Job Store Port (Interface)

use crate::domain::{Job, JobId, JobStatus, JobSummary, Stage, Transition};
use crate::error::Result;
use async_trait::async_trait;

/// Stage/progress write produced by the stage tracker
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stages: Vec<Stage>,
    pub overall_progress: i32,
    pub current_stage: Option<String>,
    /// Status change derived from the stage rollup, if any
    pub status: Option<JobStatus>,
    pub error_message: Option<String>,
    pub completed_at: Option<i64>,
}

/// Statuses a lease holder may write progress onto. Terminal statuses are
/// included because a stage rollup marks the job completed or failed before
/// the worker releases the lease.
pub const OWNED_PROGRESS_STATUSES: &[JobStatus] =
    &[JobStatus::Processing, JobStatus::Completed, JobStatus::Failed];

/// Durable job record store.
///
/// Every mutation is a conditional update against the stored row; no method
/// performs check-then-write across two round trips.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job or reset the existing row for `(queue, dedup_key)`.
    ///
    /// A reset keeps the stored id and `created_at`, and sets status to pending
    /// with the new payload, schedule and retry budget. It also clears stages,
    /// progress, errors and the lease. Returns the stored row.
    async fn upsert(&self, job: &Job) -> Result<Job>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    async fn find_by_key(&self, queue: &str, dedup_key: &str) -> Result<Option<Job>>;

    /// Atomically lease the oldest claimable job of `queue`
    /// (ordered by `scheduled_for`, then `created_at`).
    ///
    /// Reclaiming an expired processing lease increments `retry_count` and
    /// stamps `error_details.timeoutType = "lease_expired"`.
    async fn claim_next(&self, queue: &str, worker_id: &str, lease_ms: i64)
        -> Result<Option<Job>>;

    /// Extend the lease. Returns false if `worker_id` no longer holds it.
    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease_ms: i64) -> Result<bool>;

    /// Apply a lease-releasing transition.
    ///
    /// With `lease_owner` set, the row must still be leased by that worker.
    /// The current status must be in `transition.allowed_from()`.
    /// Returns None when either guard fails.
    async fn transition(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        transition: &Transition,
    ) -> Result<Option<Job>>;

    /// Persist stage list and progress.
    ///
    /// With `lease_owner` set, the row must still be leased by that worker
    /// and its status must be in `OWNED_PROGRESS_STATUSES`. Returns None when
    /// the job is gone or the guard fails.
    async fn save_progress(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        update: &ProgressUpdate,
    ) -> Result<Option<Job>>;

    /// Earliest `scheduled_for` strictly after `after_millis` among
    /// pending/retry_pending jobs of `queue`
    async fn earliest_scheduled_after(&self, queue: &str, after_millis: i64)
        -> Result<Option<i64>>;

    /// Fail processing jobs whose lease expired with no attempts left.
    /// Returns the failed jobs.
    async fn expire_abandoned(&self) -> Result<Vec<Job>>;

    /// Job counts by status for one user
    async fn status_counts(&self, user_id: &str) -> Result<JobSummary>;

    /// Completed jobs for an asset, optionally restricted to a job type
    async fn count_completed(
        &self,
        queue: &str,
        asset_id: &str,
        job_type: Option<&str>,
    ) -> Result<i64>;

    /// Release connections
    async fn close(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::JobFailure;
    use crate::port::TimeProvider;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory store with the same conditional-update semantics as the SQL stores
    pub struct InMemoryJobStore {
        jobs: Mutex<HashMap<JobId, Job>>,
        time: Arc<dyn TimeProvider>,
    }

    impl InMemoryJobStore {
        pub fn new(time: Arc<dyn TimeProvider>) -> Self {
            Self {
                jobs: Mutex::new(HashMap::new()),
                time,
            }
        }

        pub fn len(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Overwrite a stored job (test setup)
        pub fn put(&self, job: Job) {
            self.jobs.lock().unwrap().insert(job.id.clone(), job);
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn upsert(&self, job: &Job) -> Result<Job> {
            let now = self.time.now_millis();
            let mut jobs = self.jobs.lock().unwrap();

            let existing = jobs
                .values_mut()
                .find(|j| j.queue == job.queue && j.dedup_key == job.dedup_key);

            if let Some(row) = existing {
                row.job_type = job.job_type.clone();
                row.asset_id = job.asset_id.clone();
                row.user_id = job.user_id.clone();
                row.payload = job.payload.clone();
                row.status = JobStatus::Pending;
                row.stages = Vec::new();
                row.current_stage = None;
                row.overall_progress = 0;
                row.error_message = None;
                row.error_details = None;
                row.retry_count = 0;
                row.max_retries = job.max_retries;
                row.locked_by = None;
                row.locked_at = None;
                row.expires_at = None;
                row.scheduled_for = job.scheduled_for;
                row.next_retry_at = None;
                row.updated_at = now;
                row.completed_at = None;
                return Ok(row.clone());
            }

            jobs.insert(job.id.clone(), job.clone());
            Ok(job.clone())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn find_by_key(&self, queue: &str, dedup_key: &str) -> Result<Option<Job>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .find(|j| j.queue == queue && j.dedup_key == dedup_key)
                .cloned())
        }

        async fn claim_next(
            &self,
            queue: &str,
            worker_id: &str,
            lease_ms: i64,
        ) -> Result<Option<Job>> {
            let now = self.time.now_millis();
            let mut jobs = self.jobs.lock().unwrap();

            let Some(job) = jobs
                .values_mut()
                .filter(|j| j.queue == queue && j.is_claimable_at(now))
                .min_by_key(|j| (j.scheduled_for, j.created_at))
            else {
                return Ok(None);
            };

            if job.is_reclaimable_at(now) {
                job.retry_count += 1;
                job.error_details = JobFailure::timeout("lease expired", "lease_expired").details;
            }
            job.status = JobStatus::Processing;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.expires_at = Some(now + lease_ms);
            job.updated_at = now;
            Ok(Some(job.clone()))
        }

        async fn renew_lease(&self, id: &JobId, worker_id: &str, lease_ms: i64) -> Result<bool> {
            let now = self.time.now_millis();
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Processing && job.is_leased_by(worker_id) => {
                    job.expires_at = Some(now + lease_ms);
                    job.updated_at = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn transition(
            &self,
            id: &JobId,
            lease_owner: Option<&str>,
            transition: &Transition,
        ) -> Result<Option<Job>> {
            let now = self.time.now_millis();
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else {
                return Ok(None);
            };
            if let Some(owner) = lease_owner {
                if !job.is_leased_by(owner) {
                    return Ok(None);
                }
            }
            if job.apply(transition, now).is_err() {
                return Ok(None);
            }
            Ok(Some(job.clone()))
        }

        async fn save_progress(
            &self,
            id: &JobId,
            lease_owner: Option<&str>,
            update: &ProgressUpdate,
        ) -> Result<Option<Job>> {
            let now = self.time.now_millis();
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else {
                return Ok(None);
            };
            if let Some(owner) = lease_owner {
                if !job.is_leased_by(owner) || !OWNED_PROGRESS_STATUSES.contains(&job.status) {
                    return Ok(None);
                }
            }
            job.stages = update.stages.clone();
            job.overall_progress = update.overall_progress;
            job.current_stage = update.current_stage.clone();
            if let Some(status) = update.status {
                job.status = status;
            }
            if update.error_message.is_some() {
                job.error_message = update.error_message.clone();
            }
            if update.completed_at.is_some() {
                job.completed_at = update.completed_at;
            }
            job.updated_at = now;
            Ok(Some(job.clone()))
        }

        async fn earliest_scheduled_after(
            &self,
            queue: &str,
            after_millis: i64,
        ) -> Result<Option<i64>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| {
                    j.queue == queue && j.status.is_claimable() && j.scheduled_for > after_millis
                })
                .map(|j| j.scheduled_for)
                .min())
        }

        async fn expire_abandoned(&self) -> Result<Vec<Job>> {
            let now = self.time.now_millis();
            let failure = JobFailure::timeout("lease expired with no retries left", "lease_expired");
            let transition = Transition::Fail { failure };

            let mut jobs = self.jobs.lock().unwrap();
            let mut expired = Vec::new();
            for job in jobs.values_mut().filter(|j| j.is_abandoned_at(now)) {
                if job.apply(&transition, now).is_ok() {
                    expired.push(job.clone());
                }
            }
            Ok(expired)
        }

        async fn status_counts(&self, user_id: &str) -> Result<JobSummary> {
            let mut summary = JobSummary::default();
            for job in self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.user_id == user_id)
            {
                summary.add(job.status, 1);
            }
            Ok(summary)
        }

        async fn count_completed(
            &self,
            queue: &str,
            asset_id: &str,
            job_type: Option<&str>,
        ) -> Result<i64> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| {
                    j.queue == queue
                        && j.asset_id == asset_id
                        && j.status == JobStatus::Completed
                        && (job_type.is_none() || j.job_type.as_deref() == job_type)
                })
                .count() as i64)
        }

        async fn close(&self) {}
    }
}
