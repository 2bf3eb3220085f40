// Wakeup Layer - lets idle workers block until work may be available

mod timer;
mod waitlist;

pub use timer::{ScheduledWakeup, MAX_TIMER_DELAY_MS};
pub use waitlist::{Waitlist, WakeupHint};

use crate::application::worker::ShutdownToken;
use crate::domain::WakeupMessage;
use crate::port::WakeupChannel;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before re-subscribing after the remote channel drops
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Local waitlist with an optional cross-process channel layered behind it.
///
/// Notifications short-circuit to local waiters first; whatever count is
/// left over is published remotely. A bridge task feeds remote messages
/// back into the local waitlist.
pub struct Wakeup {
    waitlist: Arc<Waitlist>,
    remote: Option<Arc<dyn WakeupChannel>>,
}

impl Wakeup {
    /// Single-process wakeups only
    pub fn local() -> Self {
        Self {
            waitlist: Arc::new(Waitlist::new()),
            remote: None,
        }
    }

    pub fn with_remote(remote: Arc<dyn WakeupChannel>) -> Self {
        Self {
            waitlist: Arc::new(Waitlist::new()),
            remote: Some(remote),
        }
    }

    pub fn waitlist(&self) -> &Arc<Waitlist> {
        &self.waitlist
    }

    pub fn is_distributed(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn wait(
        &self,
        partition: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Option<WakeupHint> {
        self.waitlist.add_waiter(partition, worker_id, timeout).await
    }

    /// Wake up to `count` waiters (`None` = all). Returns the local wake count.
    pub async fn notify(&self, partition: &str, count: Option<usize>) -> usize {
        let local = match count {
            Some(n) => self.waitlist.notify_waiters(partition, n),
            None => self.waitlist.notify_all(partition),
        };

        if let Some(remote) = &self.remote {
            let remaining = count.map(|n| n.saturating_sub(local));
            if remaining != Some(0) {
                let message = WakeupMessage {
                    partition: partition.to_string(),
                    count: remaining,
                };
                if let Err(e) = remote.publish(&message).await {
                    warn!(partition, error = %e, "Failed to publish wakeup");
                }
            }
        }
        local
    }

    /// Forward remote wakeups for `partitions` into the local waitlist until shutdown.
    /// Returns None when there is no remote channel.
    pub fn spawn_bridge(
        &self,
        partitions: Vec<String>,
        mut shutdown: ShutdownToken,
    ) -> Option<JoinHandle<()>> {
        let remote = self.remote.clone()?;
        let waitlist = Arc::clone(&self.waitlist);

        Some(tokio::spawn(async move {
            info!(partitions = ?partitions, "Wakeup bridge started");
            while !shutdown.is_shutdown() {
                let mut stream = match remote.listen(&partitions).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Wakeup subscription failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                            _ = shutdown.wait() => break,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        message = stream.next() => match message {
                            Some(message) => {
                                let woken = match message.count {
                                    Some(n) => waitlist.notify_waiters(&message.partition, n),
                                    None => waitlist.notify_all(&message.partition),
                                };
                                debug!(partition = %message.partition, woken, "Remote wakeup");
                            }
                            None => {
                                warn!("Wakeup channel closed, resubscribing");
                                break;
                            }
                        },
                        _ = shutdown.wait() => return,
                    }
                }
            }
            info!("Wakeup bridge stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use crate::port::wakeup_channel::mocks::LoopbackChannel;

    #[tokio::test]
    async fn test_local_notify_skips_remote_when_satisfied() {
        let channel = Arc::new(LoopbackChannel::new());
        let wakeup = Arc::new(Wakeup::with_remote(channel.clone()));

        let waiter = {
            let wakeup = Arc::clone(&wakeup);
            tokio::spawn(async move { wakeup.wait("q", "w1", Duration::from_secs(5)).await })
        };
        while wakeup.waitlist().waiter_count("q") == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(wakeup.notify("q", Some(1)).await, 1);
        assert!(waiter.await.unwrap().is_some());
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_remainder_is_published() {
        let channel = Arc::new(LoopbackChannel::new());
        let wakeup = Wakeup::with_remote(channel.clone());

        assert_eq!(wakeup.notify("q", Some(2)).await, 0);
        assert_eq!(wakeup.notify("q", None).await, 0);
        assert_eq!(
            channel.published(),
            vec![
                WakeupMessage {
                    partition: "q".into(),
                    count: Some(2)
                },
                WakeupMessage::all("q"),
            ]
        );
    }

    #[tokio::test]
    async fn test_bridge_delivers_remote_wakeups() {
        let channel = Arc::new(LoopbackChannel::new());
        let receiver = Arc::new(Wakeup::with_remote(channel.clone()));
        let (shutdown_tx, shutdown) = shutdown_channel();
        let bridge = receiver
            .spawn_bridge(vec!["q".to_string()], shutdown)
            .unwrap();

        let waiter = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.wait("q", "w1", Duration::from_secs(5)).await })
        };
        while receiver.waitlist().waiter_count("q") == 0 {
            tokio::task::yield_now().await;
        }
        // Give the bridge a chance to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        channel.publish(&WakeupMessage::one("q")).await.unwrap();
        assert!(waiter.await.unwrap().is_some());

        shutdown_tx.shutdown();
        bridge.await.unwrap();
    }

    #[test]
    fn test_local_has_no_bridge() {
        let (_tx, shutdown) = shutdown_channel();
        assert!(Wakeup::local().spawn_bridge(vec![], shutdown).is_none());
    }
}
