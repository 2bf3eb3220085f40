//! Shared fixture: the database-backed queue over a SQLite store, in memory
//! or in a WAL file shared by several pooled connections
#![allow(dead_code)]

use cairn_core::application::{DatabaseQueue, QueueAdapter, QueueCore, RetryPolicy, Wakeup};
use cairn_core::port::event_publisher::mocks::RecordingPublisher;
use cairn_core::port::time_provider::mocks::MockTimeProvider;
use cairn_core::port::{TimeProvider, UuidProvider};
use cairn_infra_sqlite::{create_pool, run_migrations, SqliteJobStore, SqliteTaskStore};
use sqlx::SqlitePool;
use std::sync::Arc;

pub const QUEUE: &str = "bookmark-processing";
pub const LEASE_MS: i64 = 30_000;
/// 2024-03-01T10:00:00Z
pub const START_MS: i64 = 1_709_287_200_000;

pub struct Harness {
    pub pool: SqlitePool,
    pub store: Arc<SqliteJobStore>,
    pub tasks: Arc<SqliteTaskStore>,
    pub events: Arc<RecordingPublisher>,
    pub adapter: Arc<QueueAdapter>,
    /// Holds the database file of file-backed harnesses
    pub dir: Option<tempfile::TempDir>,
}

pub async fn pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Fresh database file with the bundled migrations applied
pub async fn file_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());
    let pool = create_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Queue with immediate retries so attempt loops need no clock movement
pub async fn harness(time: Arc<dyn TimeProvider>) -> Harness {
    build(pool().await, time, None)
}

/// Same queue over a WAL database file, so claims race on separate connections
pub async fn file_harness(time: Arc<dyn TimeProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    build(pool, time, Some(dir))
}

fn build(pool: SqlitePool, time: Arc<dyn TimeProvider>, dir: Option<tempfile::TempDir>) -> Harness {
    let store = Arc::new(SqliteJobStore::new(pool.clone(), Arc::clone(&time)));
    let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
    let events = Arc::new(RecordingPublisher::new());

    let core = QueueCore::new(store.clone(), events.clone(), time, Arc::new(UuidProvider))
        .with_retry_policy(RetryPolicy::new(0))
        .with_lease_ms(LEASE_MS);
    let adapter = Arc::new(QueueAdapter::Database(DatabaseQueue::new(
        core,
        Arc::new(Wakeup::local()),
    )));

    Harness {
        pool,
        store,
        tasks,
        events,
        adapter,
        dir,
    }
}

pub async fn mock_harness() -> (Harness, Arc<MockTimeProvider>) {
    let time = Arc::new(MockTimeProvider::new(START_MS));
    (harness(time.clone()).await, time)
}
