// Lease recovery - durable cleanup of jobs abandoned by crashed or stuck workers
use crate::application::governor::{StaleCallback, StaleSlot};
use crate::application::progress::StageTracker;
use crate::application::worker::ShutdownToken;
use crate::domain::{JobEventKind, JobFailure, JobStatus, Transition};
use crate::error::Result;
use crate::port::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default interval between expired-lease sweeps (1min)
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Recovery service
///
/// Expired leases with attempts left are picked up by the next claim; this
/// service handles the rest:
/// - processing jobs whose lease expired with no attempts left are failed
/// - jobs evicted from a stale governor slot are failed with a timeout marker
pub struct RecoveryService {
    store: Arc<dyn JobStore>,
    tracker: Arc<StageTracker>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn JobStore>, tracker: Arc<StageTracker>) -> Self {
        Self { store, tracker }
    }

    /// Fail abandoned jobs. Returns the number failed.
    pub async fn sweep_expired_leases(&self) -> Result<usize> {
        let expired = self.store.expire_abandoned().await?;
        for job in &expired {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                retry_count = job.retry_count,
                "Lease expired with no retries left, job failed"
            );
            self.tracker.emit(JobEventKind::JobFailed, job).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired leases recovered");
        }
        Ok(expired.len())
    }

    /// Fail still-processing jobs of an evicted governor slot
    pub async fn fail_stale_slot(&self, slot: &StaleSlot) -> Result<usize> {
        let mut failed = 0;
        for job_id in &slot.job_ids {
            let Some(job) = self.store.find_by_id(job_id).await? else {
                continue;
            };
            if job.status != JobStatus::Processing {
                continue;
            }

            let failure = JobFailure::timeout(
                format!("no completion in partition '{}'", slot.partition),
                "stale_partition",
            );
            let updated = self
                .store
                .transition(
                    job_id,
                    job.locked_by.as_deref(),
                    &Transition::Fail { failure },
                )
                .await?;

            // None: the worker finished or the lease moved on in the meantime
            if let Some(updated) = updated {
                warn!(job_id = %updated.id, partition = %slot.partition, "Stale job failed");
                self.tracker.emit(JobEventKind::JobFailed, &updated).await;
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Callback for `DomainRateLimiter::run_sweeper`
    pub fn stale_callback(self: &Arc<Self>) -> StaleCallback {
        let this = Arc::clone(self);
        Arc::new(move |slot: StaleSlot| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.fail_stale_slot(&slot).await {
                    error!(partition = %slot.partition, error = %e, "Failed to fail stale jobs");
                }
            })
        })
    }

    /// Sweep every `interval` until shutdown
    pub async fn run(&self, interval: Duration, mut shutdown: ShutdownToken) {
        info!(interval_ms = interval.as_millis() as u64, "Recovery service started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired_leases().await {
                        error!(error = %e, "Expired lease sweep failed");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("Recovery service stopped");
    }
}
