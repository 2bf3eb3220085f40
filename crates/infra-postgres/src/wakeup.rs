// LISTEN/NOTIFY wakeup channel
//
// One notification channel per partition (`wakeup_channel_name`); the
// payload is a JSON `WakeupMessage`.

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use cairn_core::domain::{wakeup_channel_name, WakeupMessage};
use cairn_core::error::Result;
use cairn_core::port::WakeupChannel;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, info, warn};

pub struct PgWakeupChannel {
    pool: PgPool,
}

impl PgWakeupChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WakeupChannel for PgWakeupChannel {
    async fn publish(&self, message: &WakeupMessage) -> Result<()> {
        let channel = wakeup_channel_name(&message.partition);
        let payload = serde_json::to_string(message)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(channel = %channel, "Wakeup published");
        Ok(())
    }

    async fn listen(&self, partitions: &[String]) -> Result<BoxStream<'static, WakeupMessage>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let channels: Vec<String> = partitions.iter().map(|p| wakeup_channel_name(p)).collect();
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(map_sqlx_error)?;
        info!(channels = ?channels, "Listening for wakeups");

        // The stream ends on a listener error; the caller resubscribes
        let messages = stream::unfold(listener, |mut listener| async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<WakeupMessage>(notification.payload()) {
                            Ok(message) => return Some((message, listener)),
                            Err(e) => {
                                warn!(channel = notification.channel(), error = %e, "Malformed wakeup payload");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Wakeup listener failed");
                        return None;
                    }
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, TEST_URL_ENV};
    use std::time::Duration;

    #[tokio::test]
    #[ignore = "requires CAIRN_TEST_POSTGRES_URL"]
    async fn test_notify_reaches_listener() {
        let Ok(url) = std::env::var(TEST_URL_ENV) else {
            return;
        };
        let pool = create_pool(&url, 2).await.unwrap();
        let channel = PgWakeupChannel::new(pool);

        let partition = "Wakeup-Test".to_string();
        let mut stream = channel.listen(&[partition.clone()]).await.unwrap();
        channel.publish(&WakeupMessage::all(&partition)).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, WakeupMessage::all(partition));
    }
}
