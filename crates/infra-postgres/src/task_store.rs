// PostgreSQL RecurringTaskStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use cairn_core::domain::{RecurrenceUpdate, RecurringTask};
use cairn_core::error::Result;
use cairn_core::port::RecurringTaskStore;
use sqlx::PgPool;

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace a task's schedule
    pub async fn save(&self, task: &RecurringTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user_id, is_recurring, cron_expression,
                recurrence_end_date, recurrence_limit, next_run_at, last_run_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                is_recurring = EXCLUDED.is_recurring,
                cron_expression = EXCLUDED.cron_expression,
                recurrence_end_date = EXCLUDED.recurrence_end_date,
                recurrence_limit = EXCLUDED.recurrence_limit,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.is_recurring)
        .bind(&task.cron_expression)
        .bind(task.recurrence_end_date)
        .bind(task.recurrence_limit)
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<RecurringTask>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, is_recurring, cron_expression, recurrence_end_date,
                   recurrence_limit, next_run_at, last_run_at
            FROM tasks WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(RecurringTask::from))
    }
}

#[async_trait]
impl RecurringTaskStore for PgTaskStore {
    async fn due_tasks(&self, now_millis: i64) -> Result<Vec<RecurringTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, is_recurring, cron_expression, recurrence_end_date,
                   recurrence_limit, next_run_at, last_run_at
            FROM tasks
            WHERE is_recurring AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC
            "#,
        )
        .bind(now_millis)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(RecurringTask::from).collect())
    }

    async fn update_recurrence(&self, task_id: &str, update: &RecurrenceUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET last_run_at = $1, next_run_at = $2, is_recurring = $3 WHERE id = $4",
        )
        .bind(update.last_run_at)
        .bind(update.next_run_at)
        .bind(update.is_recurring)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    user_id: String,
    is_recurring: bool,
    cron_expression: Option<String>,
    recurrence_end_date: Option<i64>,
    recurrence_limit: Option<i64>,
    next_run_at: Option<i64>,
    last_run_at: Option<i64>,
}

impl From<TaskRow> for RecurringTask {
    fn from(row: TaskRow) -> Self {
        RecurringTask {
            id: row.id,
            user_id: row.user_id,
            is_recurring: row.is_recurring,
            cron_expression: row.cron_expression,
            recurrence_end_date: row.recurrence_end_date,
            recurrence_limit: row.recurrence_limit,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
        }
    }
}
