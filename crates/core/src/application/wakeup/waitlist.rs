// In-process waitlist: idle workers park here until notified or timed out

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// "Work may be available" for a partition. Not a grant; the woken worker
/// still has to win the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeupHint {
    pub partition: String,
}

struct Waiter {
    id: u64,
    worker_id: String,
    since: Instant,
    tx: oneshot::Sender<WakeupHint>,
}

type WaiterMap = HashMap<String, VecDeque<Waiter>>;

/// FIFO waiters per partition key.
///
/// Only coordinates tasks within one process; cross-process wakeups go
/// through a `WakeupChannel`.
#[derive(Default)]
pub struct Waitlist {
    waiters: Mutex<WaiterMap>,
    next_id: AtomicU64,
}

/// Removes a waiter that timed out or whose future was dropped
struct WaiterGuard<'a> {
    list: &'a Waitlist,
    partition: &'a str,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.list.remove(self.partition, self.id);
    }
}

impl Waitlist {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WaiterMap> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park until notified (Some) or until `timeout` elapses (None)
    pub async fn add_waiter(
        &self,
        partition: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Option<WakeupHint> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.lock()
            .entry(partition.to_string())
            .or_default()
            .push_back(Waiter {
                id,
                worker_id: worker_id.to_string(),
                since: Instant::now(),
                tx,
            });

        let _guard = WaiterGuard {
            list: self,
            partition,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(hint)) => Some(hint),
            // Sender dropped by drain()
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(partition, worker_id, "Waiter timed out");
                None
            }
        }
    }

    /// Wake up to `count` waiters in FIFO order. Returns how many were woken.
    pub fn notify_waiters(&self, partition: &str, count: usize) -> usize {
        let mut map = self.lock();
        let Some(queue) = map.get_mut(partition) else {
            return 0;
        };

        let mut notified = 0;
        while notified < count {
            let Some(waiter) = queue.pop_front() else {
                break;
            };
            let hint = WakeupHint {
                partition: partition.to_string(),
            };
            // A dropped receiver means the worker already gave up
            if waiter.tx.send(hint).is_ok() {
                debug!(
                    partition,
                    worker_id = %waiter.worker_id,
                    waited_ms = waiter.since.elapsed().as_millis() as u64,
                    "Woke waiter"
                );
                notified += 1;
            }
        }
        if queue.is_empty() {
            map.remove(partition);
        }
        notified
    }

    pub fn notify_all(&self, partition: &str) -> usize {
        self.notify_waiters(partition, usize::MAX)
    }

    pub fn waiter_count(&self, partition: &str) -> usize {
        self.lock().get(partition).map_or(0, VecDeque::len)
    }

    /// Drop every waiter; parked workers resolve to None. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut map = self.lock();
        let count = map.values().map(VecDeque::len).sum();
        map.clear();
        count
    }

    fn remove(&self, partition: &str, id: u64) {
        let mut map = self.lock();
        if let Some(queue) = map.get_mut(partition) {
            queue.retain(|w| w.id != id);
            if queue.is_empty() {
                map.remove(partition);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn wait_for_waiters(list: &Waitlist, partition: &str, n: usize) {
        while list.waiter_count(partition) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_notify_resolves_waiter() {
        let list = Arc::new(Waitlist::new());
        let waiter = {
            let list = Arc::clone(&list);
            tokio::spawn(async move {
                list.add_waiter("photo-processing", "w1", Duration::from_secs(10))
                    .await
            })
        };
        wait_for_waiters(&list, "photo-processing", 1).await;

        assert_eq!(list.notify_waiters("photo-processing", 1), 1);
        let hint = waiter.await.unwrap();
        assert_eq!(hint.unwrap().partition, "photo-processing");
        assert_eq!(list.waiter_count("photo-processing"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_none_and_unregisters() {
        let list = Waitlist::new();
        let hint = list
            .add_waiter("q", "w1", Duration::from_millis(500))
            .await;
        assert!(hint.is_none());
        assert_eq!(list.waiter_count("q"), 0);
    }

    #[tokio::test]
    async fn test_notify_is_fifo_and_bounded_by_count() {
        let list = Arc::new(Waitlist::new());
        let mut handles = Vec::new();
        for i in 0..3 {
            let list_clone = Arc::clone(&list);
            handles.push(tokio::spawn(async move {
                let worker = format!("w{}", i);
                list_clone
                    .add_waiter("q", &worker, Duration::from_secs(10))
                    .await
                    .map(|_| worker)
            }));
            wait_for_waiters(&list, "q", i + 1).await;
        }

        assert_eq!(list.notify_waiters("q", 2), 2);
        assert_eq!(handles.remove(0).await.unwrap().as_deref(), Some("w0"));
        assert_eq!(handles.remove(0).await.unwrap().as_deref(), Some("w1"));
        assert_eq!(list.waiter_count("q"), 1);

        assert_eq!(list.drain(), 1);
        assert!(handles.remove(0).await.unwrap().is_none());
    }

    #[test]
    fn test_notify_without_waiters() {
        let list = Waitlist::new();
        assert_eq!(list.notify_all("nobody"), 0);
    }
}
