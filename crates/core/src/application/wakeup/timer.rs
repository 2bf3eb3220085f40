// Scheduled wakeup: one-shot timer per partition for the next future-dated job

use super::Wakeup;
use crate::error::Result;
use crate::port::{JobStore, TimeProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Timers never sleep longer than this; on fire they re-arm
pub const MAX_TIMER_DELAY_MS: i64 = 24 * 60 * 60 * 1000;

struct ArmedTimer {
    generation: u64,
    fires_at: i64,
    handle: JoinHandle<()>,
}

/// Wakes a partition's waiters when its earliest delayed job becomes due.
///
/// Arming queries the store for the earliest pending/retry_pending job with
/// `scheduled_for > now` and replaces any timer already armed for that
/// partition. On fire, all current waiters are notified and the timer re-arms
/// for the next-earliest job.
pub struct ScheduledWakeup {
    store: Arc<dyn JobStore>,
    wakeup: Arc<Wakeup>,
    time: Arc<dyn TimeProvider>,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    generation: AtomicU64,
}

impl ScheduledWakeup {
    pub fn new(
        store: Arc<dyn JobStore>,
        wakeup: Arc<Wakeup>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            wakeup,
            time,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re-)arm the timer for `partition`. Returns the fire time, if any job is pending.
    pub async fn arm(self: &Arc<Self>, partition: &str) -> Result<Option<i64>> {
        let now = self.time.now_millis();
        let earliest = self.store.earliest_scheduled_after(partition, now).await?;
        match earliest {
            Some(at) => {
                self.arm_at(partition.to_string(), at, now);
                Ok(Some(at))
            }
            None => {
                self.cancel(partition);
                Ok(None)
            }
        }
    }

    fn arm_at(self: &Arc<Self>, partition: String, at: i64, now: i64) {
        let delay_ms = (at - now).clamp(0, MAX_TIMER_DELAY_MS);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let this = Arc::clone(self);
        let task_partition = partition.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            this.fire(task_partition, generation).await;
        });

        debug!(partition = %partition, delay_ms, "Armed wakeup timer");
        let previous = self.timers().insert(
            partition,
            ArmedTimer {
                generation,
                fires_at: at,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    async fn fire(self: Arc<Self>, partition: String, generation: u64) {
        {
            let mut timers = self.timers();
            if timers.get(&partition).map(|t| t.generation) == Some(generation) {
                timers.remove(&partition);
            }
        }

        let woken = self.wakeup.notify(&partition, None).await;
        debug!(partition = %partition, woken, "Wakeup timer fired");

        let now = self.time.now_millis();
        match self.store.earliest_scheduled_after(&partition, now).await {
            Ok(Some(next)) => self.arm_at(partition, next, now),
            Ok(None) => {}
            Err(e) => warn!(partition = %partition, error = %e, "Failed to re-arm wakeup timer"),
        }
    }

    /// Fire time of the armed timer for `partition`
    pub fn armed_at(&self, partition: &str) -> Option<i64> {
        self.timers().get(partition).map(|t| t.fires_at)
    }

    fn cancel(&self, partition: &str) {
        if let Some(timer) = self.timers().remove(partition) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for ScheduledWakeup {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Job;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::time_provider::SystemTimeProvider;

    fn setup() -> (Arc<InMemoryJobStore>, Arc<Wakeup>, Arc<ScheduledWakeup>) {
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let store = Arc::new(InMemoryJobStore::new(Arc::clone(&time)));
        let wakeup = Arc::new(Wakeup::local());
        let timer = Arc::new(ScheduledWakeup::new(
            store.clone(),
            Arc::clone(&wakeup),
            time,
        ));
        (store, wakeup, timer)
    }

    #[tokio::test]
    async fn test_arm_without_future_jobs() {
        let (_store, _wakeup, timer) = setup();
        assert_eq!(timer.arm("q").await.unwrap(), None);
        assert!(timer.armed_at("q").is_none());
    }

    #[tokio::test]
    async fn test_timer_wakes_waiter_when_job_due() {
        let (store, wakeup, timer) = setup();
        let now = SystemTimeProvider.now_millis();

        let mut job = Job::new_test("q", "delayed");
        job.scheduled_for = now + 200;
        store.put(job);

        let armed = timer.arm("q").await.unwrap();
        assert_eq!(armed, Some(now + 200));

        let hint = wakeup.wait("q", "w1", Duration::from_secs(5)).await;
        assert!(hint.is_some(), "waiter should be woken by the timer");
    }

    #[tokio::test]
    async fn test_rearm_replaces_timer() {
        let (store, _wakeup, timer) = setup();
        let now = SystemTimeProvider.now_millis();

        let mut later = Job::new_test("q", "later");
        later.scheduled_for = now + 60_000;
        store.put(later);
        timer.arm("q").await.unwrap();

        let mut sooner = Job::new_test("q", "sooner");
        sooner.scheduled_for = now + 30_000;
        store.put(sooner);
        timer.arm("q").await.unwrap();

        assert_eq!(timer.armed_at("q"), Some(now + 30_000));
        timer.cancel_all();
        assert!(timer.armed_at("q").is_none());
    }
}
