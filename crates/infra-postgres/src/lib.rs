// Cairn Infrastructure - PostgreSQL Adapter
// Implements: JobStore, RecurringTaskStore, WakeupChannel (LISTEN/NOTIFY)

mod connection;
mod error;
mod job_store;
mod migration;
mod task_store;
mod wakeup;

pub use connection::{create_pool, DEFAULT_MAX_CONNECTIONS};
pub use job_store::PgJobStore;
pub use migration::run_migrations;
pub use task_store::PgTaskStore;
pub use wakeup::PgWakeupChannel;

/// Connection string for the ignored integration tests in this crate
#[cfg(test)]
pub(crate) const TEST_URL_ENV: &str = "CAIRN_TEST_POSTGRES_URL";
