//! Store construction per backend

use crate::config::{Backend, DaemonConfig};
use anyhow::{Context, Result};
use cairn_core::port::{JobStore, RecurringTaskStore, TimeProvider, WakeupChannel};
use std::sync::Arc;

/// Stores and transport for one backend
pub(crate) struct BackendStores {
    pub jobs: Arc<dyn JobStore>,
    pub tasks: Arc<dyn RecurringTaskStore>,
    pub remote: Option<Arc<dyn WakeupChannel>>,
}

pub(crate) async fn open_backend(
    config: &DaemonConfig,
    time: Arc<dyn TimeProvider>,
) -> Result<BackendStores> {
    match config.backend {
        Backend::Sqlite => {
            let pool = open_sqlite(&config.database_url).await?;
            Ok(BackendStores {
                jobs: Arc::new(cairn_infra_sqlite::SqliteJobStore::new(pool.clone(), time)),
                tasks: Arc::new(cairn_infra_sqlite::SqliteTaskStore::new(pool)),
                remote: None,
            })
        }
        Backend::Postgres => {
            let pool = open_postgres(&config.database_url).await?;
            Ok(BackendStores {
                jobs: Arc::new(cairn_infra_postgres::PgJobStore::new(pool.clone(), time)),
                tasks: Arc::new(cairn_infra_postgres::PgTaskStore::new(pool.clone())),
                remote: Some(Arc::new(cairn_infra_postgres::PgWakeupChannel::new(pool))),
            })
        }
        Backend::Redis => {
            let (client, conn) = cairn_infra_redis::connect(&config.redis_url)
                .await
                .context("broker connection failed")?;

            // Recurring tasks stay in the relational store
            let tasks: Arc<dyn RecurringTaskStore> = if config.database_is_postgres() {
                Arc::new(cairn_infra_postgres::PgTaskStore::new(
                    open_postgres(&config.database_url).await?,
                ))
            } else {
                Arc::new(cairn_infra_sqlite::SqliteTaskStore::new(
                    open_sqlite(&config.database_url).await?,
                ))
            };

            Ok(BackendStores {
                jobs: Arc::new(cairn_infra_redis::RedisJobStore::new(conn.clone(), time)),
                tasks,
                remote: Some(Arc::new(cairn_infra_redis::RedisWakeupChannel::new(
                    client, conn,
                ))),
            })
        }
    }
}

async fn open_sqlite(url: &str) -> Result<sqlx::SqlitePool> {
    if let Some(parent) = url
        .strip_prefix("sqlite://")
        .and_then(|path| std::path::Path::new(path).parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let pool = cairn_infra_sqlite::create_pool(url)
        .await
        .context("SQLite pool creation failed")?;
    cairn_infra_sqlite::run_migrations(&pool)
        .await
        .context("SQLite migration failed")?;
    Ok(pool)
}

async fn open_postgres(url: &str) -> Result<sqlx::PgPool> {
    let pool = cairn_infra_postgres::create_pool(url, cairn_infra_postgres::DEFAULT_MAX_CONNECTIONS)
        .await
        .context("PostgreSQL pool creation failed")?;
    cairn_infra_postgres::run_migrations(&pool)
        .await
        .context("PostgreSQL migration failed")?;
    Ok(pool)
}
