// Cairn Infrastructure - Redis Broker Adapter
// Implements: JobStore (hash per job + sorted set per state), WakeupChannel (pub/sub)

mod connection;
mod error;
mod job_store;
mod record;
mod scripts;
mod wakeup;

pub use connection::connect;
pub use job_store::{RedisJobStore, Retention, DEFAULT_KEY_PREFIX};
pub use wakeup::RedisWakeupChannel;

/// Connection string for the ignored integration tests in this crate
#[cfg(test)]
pub(crate) const TEST_URL_ENV: &str = "CAIRN_TEST_REDIS_URL";
