// Queue Adapter - one interface over the database and broker backends
//
// `QueueAdapter` is a tagged union: both variants compose the same
// `QueueCore` (store, retry policy, event emission) and differ only in how
// workers get woken.

mod broker;
mod database;
mod lazy;
pub mod validation;

pub use broker::BrokerQueue;
pub use database::DatabaseQueue;
pub use lazy::LazyQueue;

use crate::application::progress::StageTracker;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::wakeup::{Wakeup, WakeupHint};
use crate::domain::queue::asset_dedup_key;
use crate::domain::{
    Job, JobEvent, JobEventKind, JobFailure, JobId, JobPayload, JobStatus, Transition,
};
use crate::error::{AppError, Result};
use crate::port::{EventPublisher, IdProvider, JobStore, ProcessError, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default lease duration (5min)
pub const DEFAULT_LEASE_MS: i64 = 5 * 60 * 1000;

/// Enqueue request
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue: String,
    /// Deduplication key, unique per queue
    pub key: String,
    pub asset_id: String,
    pub user_id: String,
    pub job_type: Option<String>,
    pub payload: JobPayload,
    /// Earliest run time (epoch ms); now when unset
    pub scheduled_for: Option<i64>,
    pub max_retries: Option<i32>,
    /// Skip the immediate worker wakeup (batch producers notify once at the end)
    pub defer_wakeup: bool,
}

impl EnqueueRequest {
    pub fn new(
        queue: impl Into<String>,
        key: impl Into<String>,
        asset_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            key: key.into(),
            asset_id: asset_id.into(),
            user_id: user_id.into(),
            job_type: None,
            payload: JobPayload::new(payload),
            scheduled_for: None,
            max_retries: None,
            defer_wakeup: false,
        }
    }

    /// Request keyed by asset: queue = asset type, key = "<asset type>:<asset id>"
    pub fn for_asset(
        asset_type: &str,
        asset_id: &str,
        user_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            asset_type,
            asset_dedup_key(asset_type, asset_id),
            asset_id,
            user_id,
            payload,
        )
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn scheduled_at(mut self, at_millis: i64) -> Self {
        self.scheduled_for = Some(at_millis);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.defer_wakeup = true;
        self
    }
}

/// What a producer gets back from `enqueue`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub dedup_key: String,
    pub status: JobStatus,
    pub scheduled_for: i64,
}

impl From<&Job> for JobHandle {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            queue: job.queue.clone(),
            dedup_key: job.dedup_key.clone(),
            status: job.status,
            scheduled_for: job.scheduled_for,
        }
    }
}

/// Backend-independent queue operations
pub struct QueueCore {
    store: Arc<dyn JobStore>,
    tracker: Arc<StageTracker>,
    time: Arc<dyn TimeProvider>,
    ids: Arc<dyn IdProvider>,
    retry_policy: RetryPolicy,
    lease_ms: i64,
}

impl QueueCore {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<dyn EventPublisher>,
        time: Arc<dyn TimeProvider>,
        ids: Arc<dyn IdProvider>,
    ) -> Self {
        let tracker = Arc::new(StageTracker::new(
            Arc::clone(&store),
            events,
            Arc::clone(&time),
        ));
        Self {
            store,
            tracker,
            time,
            ids,
            retry_policy: RetryPolicy::default(),
            lease_ms: DEFAULT_LEASE_MS,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_lease_ms(mut self, lease_ms: i64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<StageTracker> {
        &self.tracker
    }

    pub fn now_millis(&self) -> i64 {
        self.time.now_millis()
    }

    fn build_job(&self, req: EnqueueRequest) -> Job {
        let now = self.time.now_millis();
        let mut job = Job::new(
            self.ids.generate_id(),
            now,
            req.queue,
            req.key,
            req.asset_id,
            req.user_id,
            req.payload,
        );
        job.job_type = req.job_type;
        if let Some(at) = req.scheduled_for {
            job.scheduled_for = at;
        }
        if let Some(max_retries) = req.max_retries {
            job.max_retries = max_retries;
        }
        job
    }

    /// Validate and upsert; emits `job_created`
    async fn upsert(&self, req: EnqueueRequest) -> Result<Job> {
        validation::validate_request(&req)?;
        let job = self.build_job(req);

        let stored = self.store.upsert(&job).await.map_err(|e| {
            warn!(queue = %job.queue, dedup_key = %job.dedup_key, error = %e, "Enqueue failed");
            e
        })?;

        info!(
            job_id = %stored.id,
            queue = %stored.queue,
            dedup_key = %stored.dedup_key,
            scheduled_for = stored.scheduled_for,
            reset = stored.id != job.id,
            "Job enqueued"
        );
        self.tracker.emit(JobEventKind::JobCreated, &stored).await;
        Ok(stored)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        let Some(job) = self
            .store
            .claim_next(queue, worker_id, self.lease_ms)
            .await?
        else {
            return Ok(None);
        };

        info!(
            job_id = %job.id,
            queue = %job.queue,
            worker_id,
            retry_count = job.retry_count,
            "Job claimed"
        );
        self.tracker.emit(JobEventKind::JobUpdate, &job).await;
        Ok(Some(job))
    }

    async fn renew_lease(&self, job: &Job, worker_id: &str) -> Result<bool> {
        self.store
            .renew_lease(&job.id, worker_id, self.lease_ms)
            .await
    }

    /// Apply a transition under the worker's lease, emitting the result
    async fn transition_owned(
        &self,
        job: &Job,
        worker_id: &str,
        transition: Transition,
    ) -> Result<Job> {
        match self
            .store
            .transition(&job.id, Some(worker_id), &transition)
            .await?
        {
            Some(updated) => {
                let kind = JobEvent::kind_for_status(updated.status);
                self.tracker.emit(kind, &updated).await;
                Ok(updated)
            }
            None => {
                warn!(job_id = %job.id, worker_id, "Lease lost before transition");
                Err(AppError::LeaseLost(job.id.clone()))
            }
        }
    }

    async fn complete(&self, job: &Job, worker_id: &str) -> Result<Job> {
        match self.transition_owned(job, worker_id, Transition::Complete).await {
            Err(AppError::LeaseLost(id)) => {
                // The processor may have failed the job through the tracker
                // while still reporting success
                match self.store.find_by_id(&id).await? {
                    Some(current)
                        if current.is_leased_by(worker_id)
                            && current.status == JobStatus::Failed =>
                    {
                        let err = ProcessError::failed(
                            current
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "job failed".to_string()),
                        );
                        self.fail(&current, worker_id, &err).await
                    }
                    _ => Err(AppError::LeaseLost(id)),
                }
            }
            other => {
                if let Ok(completed) = &other {
                    info!(job_id = %completed.id, queue = %completed.queue, "Job completed");
                }
                other
            }
        }
    }

    async fn fail(&self, job: &Job, worker_id: &str, err: &ProcessError) -> Result<Job> {
        let now = self.time.now_millis();
        let transition = match err {
            ProcessError::RateLimited { retry_after_ms, .. } => {
                info!(job_id = %job.id, delay_ms = retry_after_ms, "Rate limited, rescheduling");
                Transition::Reschedule {
                    run_at: now + (*retry_after_ms).max(0),
                }
            }
            ProcessError::Invalid(message) => {
                warn!(job_id = %job.id, error = %message, "Invalid job, failing without retry");
                Transition::Fail {
                    failure: JobFailure::new(message.clone())
                        .with_details(serde_json::json!({ "kind": "validation" })),
                }
            }
            ProcessError::Failed { message, details } => {
                let failure = JobFailure {
                    message: message.clone(),
                    details: details.clone(),
                };
                match self.retry_policy.decide(job) {
                    RetryDecision::Retry {
                        retry_count,
                        delay_ms,
                    } => Transition::Retry {
                        retry_count,
                        retry_at: now + delay_ms,
                        failure,
                    },
                    RetryDecision::Exhausted => {
                        warn!(job_id = %job.id, error = %message, "Job failed permanently");
                        Transition::Fail { failure }
                    }
                }
            }
        };
        self.transition_owned(job, worker_id, transition).await
    }

    async fn reschedule(&self, job: &Job, worker_id: &str, delay_ms: i64) -> Result<Job> {
        let run_at = self.time.now_millis() + delay_ms.max(0);
        self.transition_owned(job, worker_id, Transition::Reschedule { run_at })
            .await
    }

    /// Operator retry. Without `force` the job must be failed with retries left.
    /// `force` resets the attempt count and works from any status.
    async fn retry(&self, job_id: &JobId, force: bool) -> Result<Job> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        if !force && !job.can_retry() {
            return Err(AppError::InvalidState(format!(
                "Job {} is not retryable (status {}, {} of {} retries used)",
                job.id, job.status, job.retry_count, job.max_retries
            )));
        }

        let retry_count = if force { 0 } else { job.retry_count + 1 };
        let updated = self
            .store
            .transition(job_id, None, &Transition::Requeue { retry_count })
            .await?
            .ok_or_else(|| AppError::Conflict(format!("Job {} changed during retry", job_id)))?;

        info!(job_id = %updated.id, force, retry_count, "Job requeued");
        self.tracker.emit(JobEventKind::JobUpdate, &updated).await;
        Ok(updated)
    }
}

/// Backend-agnostic queue handle used by producers and workers
pub enum QueueAdapter {
    Database(DatabaseQueue),
    Broker(BrokerQueue),
}

impl QueueAdapter {
    fn core(&self) -> &QueueCore {
        match self {
            QueueAdapter::Database(q) => q.core(),
            QueueAdapter::Broker(q) => q.core(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            QueueAdapter::Database(_) => "database",
            QueueAdapter::Broker(_) => "broker",
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.core().store()
    }

    pub fn tracker(&self) -> &Arc<StageTracker> {
        self.core().tracker()
    }

    pub fn wakeup(&self) -> &Arc<Wakeup> {
        match self {
            QueueAdapter::Database(q) => q.wakeup(),
            QueueAdapter::Broker(q) => q.wakeup(),
        }
    }

    pub fn lease_ms(&self) -> i64 {
        self.core().lease_ms
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<JobHandle> {
        match self {
            QueueAdapter::Database(q) => q.enqueue(req).await,
            QueueAdapter::Broker(q) => q.enqueue(req).await,
        }
    }

    pub async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        self.core().claim(queue, worker_id).await
    }

    pub async fn renew_lease(&self, job: &Job, worker_id: &str) -> Result<bool> {
        self.core().renew_lease(job, worker_id).await
    }

    pub async fn complete(&self, job: &Job, worker_id: &str) -> Result<Job> {
        let updated = self.core().complete(job, worker_id).await?;
        self.after_schedule_change(&updated).await;
        Ok(updated)
    }

    /// Record a failed attempt: reschedule, retry with backoff, or fail terminally
    pub async fn fail(&self, job: &Job, worker_id: &str, err: &ProcessError) -> Result<Job> {
        let updated = self.core().fail(job, worker_id, err).await?;
        self.after_schedule_change(&updated).await;
        Ok(updated)
    }

    /// Release the job back to the queue after `delay_ms` without consuming a retry
    pub async fn reschedule(&self, job: &Job, worker_id: &str, delay_ms: i64) -> Result<Job> {
        let updated = self.core().reschedule(job, worker_id, delay_ms).await?;
        self.after_schedule_change(&updated).await;
        Ok(updated)
    }

    pub async fn retry(&self, job_id: &JobId, force: bool) -> Result<Job> {
        let updated = self.core().retry(job_id, force).await?;
        self.notify_workers(&updated.queue, Some(1)).await;
        Ok(updated)
    }

    /// Block until work may be available for `queue` or `timeout` elapses
    pub async fn wait_for_work(
        &self,
        queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Option<WakeupHint> {
        self.wakeup().wait(queue, worker_id, timeout).await
    }

    /// Wake up to `count` idle workers of `queue` (`None` = all)
    pub async fn notify_workers(&self, queue: &str, count: Option<usize>) -> usize {
        self.wakeup().notify(queue, count).await
    }

    pub async fn find(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.store().find_by_id(job_id).await
    }

    async fn after_schedule_change(&self, job: &Job) {
        if let QueueAdapter::Database(q) = self {
            q.after_schedule_change(job).await;
        }
    }

    pub async fn close(&self) {
        match self {
            QueueAdapter::Database(q) => q.close().await,
            QueueAdapter::Broker(q) => q.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::event_publisher::mocks::RecordingPublisher;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::time_provider::mocks::MockTimeProvider;
    use serde_json::json;

    struct Fixture {
        time: Arc<MockTimeProvider>,
        events: Arc<RecordingPublisher>,
        queue: QueueAdapter,
    }

    fn fixture() -> Fixture {
        let time = Arc::new(MockTimeProvider::new(1_000_000));
        let store = Arc::new(InMemoryJobStore::new(time.clone()));
        let events = Arc::new(RecordingPublisher::new());
        let core = QueueCore::new(
            store,
            events.clone(),
            time.clone(),
            Arc::new(SequentialIdProvider::new("job")),
        )
        .with_retry_policy(RetryPolicy::new(0))
        .with_lease_ms(30_000);
        let queue = QueueAdapter::Database(DatabaseQueue::new(core, Arc::new(Wakeup::local())));
        Fixture {
            time,
            events,
            queue,
        }
    }

    fn note() -> EnqueueRequest {
        EnqueueRequest::for_asset("note-processing", "abc", "user-1", json!({"noteId": "abc"}))
    }

    #[tokio::test]
    async fn test_enqueue_twice_updates_in_place() {
        let f = fixture();
        let first = f.queue.enqueue(note()).await.unwrap();
        let second = f
            .queue
            .enqueue(note().with_max_retries(5))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.dedup_key, "note-processing:abc");
        let job = f.queue.find(&first.id).await.unwrap().unwrap();
        assert_eq!(job.max_retries, 5);
        assert_eq!(
            f.events.kinds(),
            vec![JobEventKind::JobCreated, JobEventKind::JobCreated]
        );
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_persisted() {
        let f = fixture();
        let mut req = note();
        req.queue = "bad queue".to_string();
        let err = f.queue.enqueue(req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_does_not_consume_retry() {
        let f = fixture();
        let handle = f.queue.enqueue(note()).await.unwrap();
        let job = f.queue.claim("note-processing", "w1").await.unwrap().unwrap();

        let updated = f
            .queue
            .fail(&job, "w1", &ProcessError::rate_limited(60_000))
            .await
            .unwrap();

        assert_eq!(updated.id, handle.id);
        assert_eq!(updated.status, JobStatus::Pending);
        assert_eq!(updated.retry_count, 0);
        assert_eq!(updated.scheduled_for, f.time.now_millis() + 60_000);
        assert!(f.queue.claim("note-processing", "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_fails_without_retry() {
        let f = fixture();
        f.queue.enqueue(note()).await.unwrap();
        let job = f.queue.claim("note-processing", "w1").await.unwrap().unwrap();

        let updated = f
            .queue
            .fail(&job, "w1", &ProcessError::Invalid("missing noteId".into()))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.retry_count, 0);
        assert_eq!(f.events.kinds().last(), Some(&JobEventKind::JobFailed));
    }

    #[tokio::test]
    async fn test_complete_requires_lease() {
        let f = fixture();
        f.queue.enqueue(note()).await.unwrap();
        let job = f.queue.claim("note-processing", "w1").await.unwrap().unwrap();

        let err = f.queue.complete(&job, "w2").await.unwrap_err();
        assert!(matches!(err, AppError::LeaseLost(_)));

        let done = f.queue.complete(&job, "w1").await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_complete_after_tracker_failure_records_failure() {
        let f = fixture();
        f.queue.enqueue(note()).await.unwrap();
        let job = f.queue.claim("note-processing", "w1").await.unwrap().unwrap();
        f.queue.tracker().fail_job(&job.id, "model timeout").await.unwrap();

        let updated = f.queue.complete(&job, "w1").await.unwrap();
        assert_eq!(updated.status, JobStatus::RetryPending);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.error_message.as_deref(), Some("model timeout"));
    }

    #[tokio::test]
    async fn test_operator_retry_rules() {
        let f = fixture();
        f.queue.enqueue(note().with_max_retries(1)).await.unwrap();

        let job = f.queue.claim("note-processing", "w1").await.unwrap().unwrap();
        let err = f.queue.retry(&job.id, false).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)), "processing is not retryable");

        let failed = f
            .queue
            .fail(&job, "w1", &ProcessError::Invalid("bad".into()))
            .await
            .unwrap();
        assert!(failed.can_retry());

        let retried = f.queue.retry(&job.id, false).await.unwrap();
        assert_eq!(retried.status, JobStatus::RetryPending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());

        let missing = f.queue.retry(&"nope".to_string(), true).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }
}
