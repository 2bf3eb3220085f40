// Migration Runner

use crate::error::map_sqlx_error;
use cairn_core::error::Result;
use sqlx::PgPool;
use tracing::info;

/// Ordered (version, description, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "Jobs", include_str!("../migrations/001_jobs.sql")),
    (
        2,
        "Recurring tasks",
        include_str!("../migrations/002_recurring_tasks.sql"),
    ),
];

/// Run database migrations.
///
/// Concurrent runners serialize on a transaction-scoped advisory lock.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('cairn_migrations'))")
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version BIGINT PRIMARY KEY, applied_at BIGINT NOT NULL)",
    )
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

    info!("Current schema version: {}", current_version);

    for (version, description, sql) in MIGRATIONS {
        if current_version >= *version {
            continue;
        }
        info!("Applying migration {:03}: {}", version, description);

        for statement in split_statements(sql) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        sqlx::query(
            "INSERT INTO schema_version (version, applied_at) VALUES ($1, (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT)",
        )
        .bind(*version)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
    }

    tx.commit().await.map_err(map_sqlx_error)?;
    info!("All migrations applied successfully");
    Ok(())
}

/// Statements of a migration file, comment lines removed before splitting
fn split_statements(sql: &str) -> Vec<String> {
    let without_comments = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}
