// Wakeup Channel Port
// Cross-process "work may be available" notifications, one channel per partition

use crate::domain::WakeupMessage;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[async_trait]
pub trait WakeupChannel: Send + Sync {
    async fn publish(&self, message: &WakeupMessage) -> Result<()>;

    /// Subscribe to the given partitions. The stream ends when the
    /// underlying connection closes.
    async fn listen(&self, partitions: &[String]) -> Result<BoxStream<'static, WakeupMessage>>;
}

pub mod mocks {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// In-process loopback channel (stands in for LISTEN/NOTIFY or pub/sub)
    pub struct LoopbackChannel {
        tx: broadcast::Sender<WakeupMessage>,
        published: Mutex<Vec<WakeupMessage>>,
    }

    impl LoopbackChannel {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(64);
            Self {
                tx,
                published: Mutex::new(Vec::new()),
            }
        }

        pub fn published(&self) -> Vec<WakeupMessage> {
            self.published.lock().unwrap().clone()
        }
    }

    impl Default for LoopbackChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl WakeupChannel for LoopbackChannel {
        async fn publish(&self, message: &WakeupMessage) -> Result<()> {
            self.published.lock().unwrap().push(message.clone());
            let _ = self.tx.send(message.clone());
            Ok(())
        }

        async fn listen(
            &self,
            partitions: &[String],
        ) -> Result<BoxStream<'static, WakeupMessage>> {
            let partitions = partitions.to_vec();
            let stream = broadcast_stream(self.tx.subscribe())
                .filter(move |m| futures::future::ready(partitions.contains(&m.partition)));
            Ok(stream.boxed())
        }
    }

    /// Stream over a broadcast receiver that skips lagged gaps
    fn broadcast_stream<T: Clone + Send + 'static>(
        rx: broadcast::Receiver<T>,
    ) -> impl futures::Stream<Item = T> + Send + 'static {
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(item) => return Some((item, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
