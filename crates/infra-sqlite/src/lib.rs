// Cairn Infrastructure - SQLite Adapter
// Implements: JobStore, RecurringTaskStore

mod connection;
mod error;
mod job_store;
mod migration;
mod task_store;

pub use connection::{create_pool, DEFAULT_MAX_CONNECTIONS};
pub use job_store::SqliteJobStore;
pub use migration::run_migrations;
pub use task_store::SqliteTaskStore;

// sqlx::Error conversion lives in `error::map_sqlx_error`: the orphan rule
// forbids `From<sqlx::Error> for AppError` here
