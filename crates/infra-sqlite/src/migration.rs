// Migration Runner

use crate::error::map_sqlx_error;
use cairn_core::error::Result;
use sqlx::SqlitePool;
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

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?;

    info!("Current schema version: {}", current_version);

    for (version, description, sql) in MIGRATIONS {
        if current_version < *version {
            info!("Applying migration {:03}: {}", version, description);
            apply_migration(pool, *version, sql).await?;
        }
    }

    info!("All migrations applied successfully");
    Ok(())
}

/// Apply a single migration SQL file and record its version
async fn apply_migration(pool: &SqlitePool, version: i64, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    for statement in split_statements(sql) {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
    }

    sqlx::query(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, CAST(strftime('%s', 'now') AS INTEGER) * 1000)",
    )
    .bind(version)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    tx.commit().await.map_err(map_sqlx_error)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_split_ignores_semicolons_in_comments() {
        let sql = "-- header; with a semicolon\nCREATE TABLE a (x INTEGER);\n  -- trailing; note\nCREATE INDEX i ON a(x);\n";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (x INTEGER)", "CREATE INDEX i ON a(x)"]
        );
    }

    #[tokio::test]
    async fn test_bundled_migrations_apply_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'tasks') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["jobs".to_string(), "tasks".to_string()]);

        // A second pool on the same file sees the recorded version
        pool.close().await;
        let reopened = create_pool(&url).await.unwrap();
        run_migrations(&reopened).await.unwrap();
        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&reopened)
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_bundled_migrations_split_into_statements() {
        for (version, _, sql) in MIGRATIONS {
            for statement in split_statements(sql) {
                assert!(
                    !statement.contains("--"),
                    "migration {} left a comment in: {}",
                    version,
                    statement
                );
                let head = statement.split_whitespace().next().unwrap_or_default();
                assert!(
                    matches!(head, "CREATE" | "ALTER" | "DROP" | "INSERT" | "UPDATE"),
                    "migration {} statement starts with {:?}",
                    version,
                    head
                );
            }
        }
    }
}
