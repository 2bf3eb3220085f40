// Worker - Job execution loop

pub mod constants;
mod shutdown;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::governor::DomainRateLimiter;
use crate::application::queue::QueueAdapter;
use crate::domain::Job;
use crate::error::{AppError, Result};
use crate::port::{JobContext, JobProcessor, Partition, ProcessError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Worker processes jobs from one queue
pub struct Worker {
    worker_id: String,
    queue: String,
    adapter: Arc<QueueAdapter>,
    processor: Arc<dyn JobProcessor>,
    governor: Option<Arc<DomainRateLimiter>>,
    idle_wait: Duration,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        adapter: Arc<QueueAdapter>,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue: queue.into(),
            adapter,
            processor,
            governor: None,
            idle_wait: IDLE_WAIT,
        }
    }

    /// Gate jobs through a rate/concurrency governor
    pub fn with_governor(mut self, governor: Arc<DomainRateLimiter>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run worker loop with graceful shutdown support.
    ///
    /// An in-flight job is finished before the loop exits.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(worker_id = %self.worker_id, queue = %self.queue, "Worker started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            match self.process_next_job().await {
                Ok(true) => {}
                Ok(false) => {
                    // Idle: park on the waitlist until woken or the poll interval passes
                    tokio::select! {
                        hint = self.adapter.wait_for_work(&self.queue, &self.worker_id, self.idle_wait) => {
                            if hint.is_some() {
                                debug!(worker_id = %self.worker_id, "Woken for new work");
                            }
                        }
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Worker error");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, queue = %self.queue, "Worker stopped");
        Ok(())
    }

    /// Claim and process one job. Returns false when the queue had nothing claimable.
    pub async fn process_next_job(&self) -> Result<bool> {
        let Some(job) = self.adapter.claim(&self.queue, &self.worker_id).await? else {
            return Ok(false);
        };

        let partition = self.processor.partition(&job);
        if let (Some(governor), Some(partition)) = (&self.governor, &partition) {
            let admission =
                governor.try_acquire(&partition.key, partition.handler.as_deref(), &job.id);
            if !admission.can_process {
                info!(
                    job_id = %job.id,
                    partition = %partition.key,
                    delay_ms = admission.delay_ms,
                    reason = admission.reason.as_deref().unwrap_or(""),
                    "Partition not admitted, rescheduling"
                );
                self.settle(self.adapter.reschedule(&job, &self.worker_id, admission.delay_ms).await)?;
                return Ok(true);
            }
        }

        let outcome = self.execute(&job).await;

        if let (Some(governor), Some(partition)) = (&self.governor, &partition) {
            governor.mark_complete(&partition.key, &job.id);
        }

        let settled = match outcome {
            Ok(()) => self.adapter.complete(&job, &self.worker_id).await,
            Err(err) => {
                self.block_partition(&err, partition.as_ref());
                warn!(job_id = %job.id, error = %err, "Job attempt failed");
                self.adapter.fail(&job, &self.worker_id, &err).await
            }
        };
        self.settle(settled)?;
        Ok(true)
    }

    /// Losing the lease discards our result; anything else propagates
    fn settle(&self, result: Result<Job>) -> Result<()> {
        match result {
            Ok(job) => {
                debug!(job_id = %job.id, status = %job.status, "Job settled");
                Ok(())
            }
            Err(AppError::LeaseLost(job_id)) => {
                warn!(job_id = %job_id, worker_id = %self.worker_id, "Lease lost, result discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn block_partition(&self, err: &ProcessError, partition: Option<&Partition>) {
        if let (
            ProcessError::RateLimited {
                block_for_ms: Some(block_for_ms),
                ..
            },
            Some(governor),
            Some(partition),
        ) = (err, &self.governor, partition)
        {
            governor.block(&partition.key, Some(*block_for_ms), "blocked by destination");
        }
    }

    /// Run the processor in its own task (panic isolation) while renewing the lease
    async fn execute(&self, job: &Job) -> std::result::Result<(), ProcessError> {
        let ctx = JobContext {
            job: job.clone(),
            worker_id: self.worker_id.clone(),
            tracker: Arc::new(self.adapter.tracker().owned_by(self.worker_id.clone())),
        };
        let processor = Arc::clone(&self.processor);
        let mut handle = tokio::spawn(async move { processor.process(ctx).await });

        let every = Duration::from_millis((self.adapter.lease_ms() / HEARTBEAT_DIVISOR).max(1) as u64);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        let mut lease_held = true;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = heartbeat.tick(), if lease_held => {
                    match self.adapter.renew_lease(job, &self.worker_id).await {
                        Ok(true) => debug!(job_id = %job.id, "Lease renewed"),
                        Ok(false) => {
                            warn!(job_id = %job.id, worker_id = %self.worker_id, "Lease lost during processing");
                            lease_held = false;
                        }
                        Err(e) => warn!(job_id = %job.id, error = %e, "Lease renewal failed"),
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(join_err) => {
                // Panics are not retried
                error!(job_id = %job.id, error = %join_err, "Processor panicked");
                Err(ProcessError::Invalid(format!("processor panicked: {}", join_err)))
            }
        }
    }
}
