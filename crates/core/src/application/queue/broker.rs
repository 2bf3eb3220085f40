// Broker-backed queue: the broker's store holds jobs and retention; wakeups
// travel over the broker's pub/sub. Delayed jobs are found by worker polling.

use super::{EnqueueRequest, JobHandle, QueueCore};
use crate::application::wakeup::Wakeup;
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

pub struct BrokerQueue {
    core: QueueCore,
    wakeup: Arc<Wakeup>,
}

impl BrokerQueue {
    pub fn new(core: QueueCore, wakeup: Arc<Wakeup>) -> Self {
        Self { core, wakeup }
    }

    pub(super) fn core(&self) -> &QueueCore {
        &self.core
    }

    pub(super) fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<JobHandle> {
        let defer_wakeup = req.defer_wakeup;
        let job = self.core.upsert(req).await?;

        let due = job.scheduled_for <= self.core.now_millis();
        if due && !defer_wakeup {
            self.wakeup.notify(&job.queue, Some(1)).await;
        }
        Ok(JobHandle::from(&job))
    }

    pub async fn close(&self) {
        let dropped = self.wakeup.waitlist().drain();
        self.core.store().close().await;
        info!(dropped_waiters = dropped, "Broker queue closed");
    }
}
