// Broker connection

use crate::error::map_redis_error;
use cairn_core::error::Result;
use redis::aio::ConnectionManager;
use tracing::info;

/// Open a reconnecting, multiplexed connection
pub async fn connect(url: &str) -> Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url).map_err(map_redis_error)?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(map_redis_error)?;
    info!("Connected to broker");
    Ok((client, manager))
}
