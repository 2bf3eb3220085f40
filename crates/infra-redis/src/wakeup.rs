// Pub/sub wakeup channel

use crate::error::map_redis_error;
use async_trait::async_trait;
use cairn_core::domain::{wakeup_channel_name, WakeupMessage};
use cairn_core::error::Result;
use cairn_core::port::WakeupChannel;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Publishes on the shared connection; each `listen` opens its own
/// subscriber connection
pub struct RedisWakeupChannel {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisWakeupChannel {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl WakeupChannel for RedisWakeupChannel {
    async fn publish(&self, message: &WakeupMessage) -> Result<()> {
        let channel = wakeup_channel_name(&message.partition);
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(map_redis_error)?;
        debug!(channel = %channel, receivers, "Wakeup published");
        Ok(())
    }

    async fn listen(&self, partitions: &[String]) -> Result<BoxStream<'static, WakeupMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;
        let channels: Vec<String> = partitions.iter().map(|p| wakeup_channel_name(p)).collect();
        for channel in &channels {
            pubsub.subscribe(channel).await.map_err(map_redis_error)?;
        }
        info!(channels = ?channels, "Subscribed to wakeups");

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = msg.get_channel_name(), error = %e, "Unreadable wakeup payload");
                    return None;
                }
            };
            match serde_json::from_str::<WakeupMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(channel = msg.get_channel_name(), error = %e, "Malformed wakeup payload");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }
}
