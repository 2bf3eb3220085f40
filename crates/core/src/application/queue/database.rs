// Database-backed queue: store upsert + in-process/NOTIFY wakeups + delay timers

use super::{EnqueueRequest, JobHandle, QueueCore};
use crate::application::wakeup::{ScheduledWakeup, Wakeup};
use crate::domain::{Job, JobStatus};
use crate::error::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct DatabaseQueue {
    core: QueueCore,
    wakeup: Arc<Wakeup>,
    timer: Arc<ScheduledWakeup>,
}

impl DatabaseQueue {
    pub fn new(core: QueueCore, wakeup: Arc<Wakeup>) -> Self {
        let timer = Arc::new(ScheduledWakeup::new(
            Arc::clone(core.store()),
            Arc::clone(&wakeup),
            Arc::clone(&core.time),
        ));
        Self {
            core,
            wakeup,
            timer,
        }
    }

    pub(super) fn core(&self) -> &QueueCore {
        &self.core
    }

    pub(super) fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    pub fn timer(&self) -> &Arc<ScheduledWakeup> {
        &self.timer
    }

    /// Upsert, wake one idle worker, and arm the delay timer for future-dated jobs
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<JobHandle> {
        let defer_wakeup = req.defer_wakeup;
        let job = self.core.upsert(req).await?;

        if !defer_wakeup {
            self.wakeup.notify(&job.queue, Some(1)).await;
        }
        self.after_schedule_change(&job).await;
        Ok(JobHandle::from(&job))
    }

    /// Arm the partition's timer when the job now waits for a future time
    pub(super) async fn after_schedule_change(&self, job: &Job) {
        let waiting = matches!(job.status, JobStatus::Pending | JobStatus::RetryPending);
        if !waiting || job.scheduled_for <= self.core.now_millis() {
            return;
        }
        if let Err(e) = self.timer.arm(&job.queue).await {
            warn!(queue = %job.queue, error = %e, "Failed to arm wakeup timer");
        }
    }

    pub async fn close(&self) {
        self.timer.cancel_all();
        let dropped = self.wakeup.waitlist().drain();
        self.core.store().close().await;
        info!(dropped_waiters = dropped, "Database queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::queue::QueueAdapter;
    use crate::port::event_publisher::mocks::RecordingPublisher;
    use crate::port::id_provider::UuidProvider;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::time_provider::SystemTimeProvider;
    use crate::port::TimeProvider;
    use serde_json::json;
    use std::time::Duration;

    fn queue() -> Arc<QueueAdapter> {
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let core = QueueCore::new(
            Arc::new(InMemoryJobStore::new(Arc::clone(&time))),
            Arc::new(RecordingPublisher::new()),
            time,
            Arc::new(UuidProvider),
        );
        Arc::new(QueueAdapter::Database(DatabaseQueue::new(
            core,
            Arc::new(Wakeup::local()),
        )))
    }

    #[tokio::test]
    async fn test_enqueue_wakes_idle_worker() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .wait_for_work("photo-processing", "w1", Duration::from_secs(5))
                    .await
            })
        };
        while queue.wakeup().waitlist().waiter_count("photo-processing") == 0 {
            tokio::task::yield_now().await;
        }

        let req = EnqueueRequest::for_asset("photo-processing", "p1", "u1", json!({}));
        queue.enqueue(req).await.unwrap();
        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deferred_enqueue_does_not_wake() {
        let queue = queue();
        let req = EnqueueRequest::for_asset("photo-processing", "p1", "u1", json!({})).deferred();
        queue.enqueue(req).await.unwrap();

        let hint = queue
            .wait_for_work("photo-processing", "w1", Duration::from_millis(50))
            .await;
        assert!(hint.is_none());
    }

    #[tokio::test]
    async fn test_future_job_arms_timer() {
        let queue = queue();
        let at = SystemTimeProvider.now_millis() + 60_000;
        let req = EnqueueRequest::for_asset("photo-processing", "p1", "u1", json!({})).scheduled_at(at);
        queue.enqueue(req).await.unwrap();

        let QueueAdapter::Database(db) = queue.as_ref() else {
            panic!("expected database queue");
        };
        assert_eq!(db.timer().armed_at("photo-processing"), Some(at));
        queue.close().await;
        assert!(db.timer().armed_at("photo-processing").is_none());
    }
}
