// SQLite JobStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use cairn_core::domain::{
    Job, JobFailure, JobId, JobPayload, JobStatus, JobSummary, Stage, Transition,
};
use cairn_core::error::{AppError, Result};
use cairn_core::port::{JobStore, ProgressUpdate, TimeProvider};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};

/// Claimable: a due pending/retry_pending job without a live lease, or an
/// expired processing lease with attempts left. `?1` is now.
const CLAIMABLE: &str = r#"
    (
        (status IN ('pending', 'retry_pending')
            AND scheduled_for <= ?1
            AND (locked_by IS NULL OR expires_at < ?1))
        OR (status = 'processing' AND expires_at < ?1 AND retry_count < max_retries)
    )
"#;

pub struct SqliteJobStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn push_failure(qb: &mut QueryBuilder<'_, Sqlite>, failure: &JobFailure) {
    qb.push(", error_message = ")
        .push_bind(failure.message.clone());
    qb.push(", error_details = ")
        .push_bind(failure.details.as_ref().map(|d| d.to_string()));
}

/// Conditional UPDATE for a transition: status guard from `allowed_from`,
/// optional lease-owner guard, lease always released
fn transition_query(
    id: &str,
    lease_owner: Option<&str>,
    transition: &Transition,
    now: i64,
) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("UPDATE jobs SET status = ");
    qb.push_bind(transition.target().as_str());
    qb.push(", locked_by = NULL, locked_at = NULL, expires_at = NULL, updated_at = ")
        .push_bind(now);

    match transition {
        Transition::Complete => {
            qb.push(", completed_at = ").push_bind(now);
            qb.push(", error_message = NULL, error_details = NULL");
        }
        Transition::Retry {
            retry_count,
            retry_at,
            failure,
        } => {
            qb.push(", retry_count = ").push_bind(*retry_count);
            qb.push(", next_retry_at = ").push_bind(*retry_at);
            qb.push(", scheduled_for = ").push_bind(*retry_at);
            push_failure(&mut qb, failure);
        }
        Transition::Reschedule { run_at } => {
            qb.push(", scheduled_for = ").push_bind(*run_at);
            qb.push(", next_retry_at = NULL");
        }
        Transition::Fail { failure } => push_failure(&mut qb, failure),
        Transition::Requeue { retry_count } => {
            qb.push(", retry_count = ").push_bind(*retry_count);
            qb.push(", scheduled_for = ").push_bind(now);
            qb.push(
                ", next_retry_at = NULL, completed_at = NULL, error_message = NULL, error_details = NULL",
            );
        }
    }

    qb.push(" WHERE id = ").push_bind(id.to_string());
    qb.push(" AND status IN (");
    let mut statuses = qb.separated(", ");
    for status in transition.allowed_from() {
        statuses.push_bind(status.as_str());
    }
    statuses.push_unseparated(")");
    if let Some(owner) = lease_owner {
        qb.push(" AND locked_by = ").push_bind(owner.to_string());
    }
    qb.push(" RETURNING *");
    qb
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn upsert(&self, job: &Job) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, queue, dedup_key, job_type, asset_id, user_id, payload,
                status, stages, overall_progress, retry_count, max_retries,
                scheduled_for, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', '[]', 0, 0, ?, ?, ?, ?)
            ON CONFLICT (queue, dedup_key) DO UPDATE SET
                job_type = excluded.job_type,
                asset_id = excluded.asset_id,
                user_id = excluded.user_id,
                payload = excluded.payload,
                status = 'pending',
                stages = '[]',
                current_stage = NULL,
                overall_progress = 0,
                error_message = NULL,
                error_details = NULL,
                retry_count = 0,
                max_retries = excluded.max_retries,
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                scheduled_for = excluded.scheduled_for,
                next_retry_at = NULL,
                updated_at = excluded.updated_at,
                completed_at = NULL
            RETURNING *
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(&job.dedup_key)
        .bind(&job.job_type)
        .bind(&job.asset_id)
        .bind(&job.user_id)
        .bind(job.payload.as_value().to_string())
        .bind(job.max_retries)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .bind(self.time_provider.now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.into_job()
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_by_key(&self, queue: &str, dedup_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE queue = ? AND dedup_key = ?",
        )
        .bind(queue)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();

        // Single statement: the subquery pick and the update are atomic.
        // SET expressions see the pre-update row, so `status = 'processing'`
        // identifies a reclaim of an expired lease.
        let sql = format!(
            r#"
            UPDATE jobs
            SET retry_count = CASE WHEN status = 'processing' THEN retry_count + 1 ELSE retry_count END,
                error_details = CASE WHEN status = 'processing'
                    THEN '{{"timeoutType":"lease_expired"}}' ELSE error_details END,
                status = 'processing',
                locked_by = ?2,
                locked_at = ?1,
                expires_at = ?3,
                updated_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?4 AND {claimable}
                ORDER BY scheduled_for ASC, created_at ASC
                LIMIT 1
            )
            AND {claimable}
            RETURNING *
            "#,
            claimable = CLAIMABLE
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(worker_id)
            .bind(now + lease_ms)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND locked_by = ?
            "#,
        )
        .bind(now + lease_ms)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        transition: &Transition,
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();
        let row = transition_query(id, lease_owner, transition, now)
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if row.is_none() {
            debug!(job_id = %id, target = %transition.target(), "Transition guard rejected");
        }
        row.map(JobRow::into_job).transpose()
    }

    async fn save_progress(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        update: &ProgressUpdate,
    ) -> Result<Option<Job>> {
        let stages = serde_json::to_string(&update.stages)?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET stages = ?,
                overall_progress = ?,
                current_stage = ?,
                status = COALESCE(?, status),
                error_message = COALESCE(?, error_message),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
              AND (? IS NULL OR (locked_by = ? AND status IN ('processing', 'completed', 'failed')))
            RETURNING *
            "#,
        )
        .bind(stages)
        .bind(update.overall_progress)
        .bind(&update.current_stage)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.error_message)
        .bind(update.completed_at)
        .bind(self.time_provider.now_millis())
        .bind(id)
        .bind(lease_owner)
        .bind(lease_owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn earliest_scheduled_after(
        &self,
        queue: &str,
        after_millis: i64,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT MIN(scheduled_for) FROM jobs
            WHERE queue = ? AND status IN ('pending', 'retry_pending') AND scheduled_for > ?
            "#,
        )
        .bind(queue)
        .bind(after_millis)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn expire_abandoned(&self) -> Result<Vec<Job>> {
        let now = self.time_provider.now_millis();
        let failure = JobFailure::timeout("lease expired with no retries left", "lease_expired");

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = ?,
                error_details = ?,
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                updated_at = ?
            WHERE status = 'processing' AND expires_at < ? AND retry_count >= max_retries
            RETURNING *
            "#,
        )
        .bind(&failure.message)
        .bind(failure.details.as_ref().map(|d| d.to_string()))
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn status_counts(&self, user_id: &str) -> Result<JobSummary> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE user_id = ? GROUP BY status",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut summary = JobSummary::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(status) => summary.add(status, count),
                Err(e) => warn!(user_id, error = %e, "Skipping unknown status in summary"),
            }
        }
        Ok(summary)
    }

    async fn count_completed(
        &self,
        queue: &str,
        asset_id: &str,
        job_type: Option<&str>,
    ) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE queue = ? AND asset_id = ? AND status = 'completed'
              AND (? IS NULL OR job_type = ?)
            "#,
        )
        .bind(queue)
        .bind(asset_id)
        .bind(job_type)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    dedup_key: String,
    job_type: Option<String>,
    asset_id: String,
    user_id: String,
    payload: String,

    status: String,
    stages: String,
    current_stage: Option<String>,
    overall_progress: i32,
    error_message: Option<String>,
    error_details: Option<String>,

    retry_count: i32,
    max_retries: i32,

    locked_by: Option<String>,
    locked_at: Option<i64>,
    expires_at: Option<i64>,

    scheduled_for: i64,
    next_retry_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status: JobStatus = self.status.parse()?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let stages: Vec<Stage> = serde_json::from_str(&self.stages)?;
        let error_details = self
            .error_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Database(format!("Corrupt error_details on job {}: {}", self.id, e)))?;

        Ok(Job {
            id: self.id,
            queue: self.queue,
            dedup_key: self.dedup_key,
            job_type: self.job_type,
            asset_id: self.asset_id,
            user_id: self.user_id,
            payload: JobPayload::new(payload),
            status,
            stages,
            current_stage: self.current_stage,
            overall_progress: self.overall_progress,
            error_message: self.error_message,
            error_details,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            expires_at: self.expires_at,
            scheduled_for: self.scheduled_for,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use cairn_core::domain::{StageStatus, Transition};
    use cairn_core::port::time_provider::mocks::MockTimeProvider;

    async fn setup_test_db() -> (SqliteJobStore, Arc<MockTimeProvider>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let time = Arc::new(MockTimeProvider::new(1_000_000));
        (SqliteJobStore::new(pool, time.clone()), time)
    }

    fn job(time: &MockTimeProvider, id: &str, key: &str) -> Job {
        Job::new(
            id.to_string(),
            time.now_millis(),
            "note-processing",
            key,
            key,
            "u1",
            JobPayload::new(serde_json::json!({"noteId": key})),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let (store, time) = setup_test_db().await;
        let stored = store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        let found = store.find_by_id(&"j1".to_string()).await.unwrap().unwrap();
        assert_eq!(found, stored);
        let by_key = store.find_by_key("note-processing", "n1").await.unwrap();
        assert_eq!(by_key.map(|j| j.id), Some("j1".to_string()));
    }

    #[tokio::test]
    async fn test_upsert_resets_existing_row() {
        let (store, time) = setup_test_db().await;
        store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        let claimed = store.claim_next("note-processing", "w1", 1000).await.unwrap().unwrap();
        store
            .transition(&claimed.id, Some("w1"), &Transition::Fail { failure: JobFailure::new("boom") })
            .await
            .unwrap();

        time.advance(10);
        let mut again = job(&time, "j2", "n1");
        again.max_retries = 7;
        let reset = store.upsert(&again).await.unwrap();

        assert_eq!(reset.id, "j1");
        assert_eq!(reset.created_at, 1_000_000);
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.max_retries, 7);
        assert!(reset.error_message.is_none());
        assert!(reset.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_claim_order_and_schedule() {
        let (store, time) = setup_test_db().await;
        let mut later = job(&time, "later", "a");
        later.scheduled_for += 60_000;
        store.upsert(&later).await.unwrap();
        time.advance(1);
        store.upsert(&job(&time, "first", "b")).await.unwrap();
        time.advance(1);
        store.upsert(&job(&time, "second", "c")).await.unwrap();

        let a = store.claim_next("note-processing", "w1", 1000).await.unwrap().unwrap();
        let b = store.claim_next("note-processing", "w2", 1000).await.unwrap().unwrap();
        assert_eq!((a.id.as_str(), b.id.as_str()), ("first", "second"));
        assert_eq!(a.locked_by.as_deref(), Some("w1"));
        assert_eq!(a.expires_at, Some(time.now_millis() + 1000));
        assert!(store.claim_next("note-processing", "w3", 1000).await.unwrap().is_none());

        assert_eq!(
            store.earliest_scheduled_after("note-processing", time.now_millis()).await.unwrap(),
            Some(later.scheduled_for)
        );
        assert!(store.claim_next("other-queue", "w1", 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_with_retry_increment() {
        let (store, time) = setup_test_db().await;
        store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        store.claim_next("note-processing", "w1", 1000).await.unwrap().unwrap();
        assert!(store.claim_next("note-processing", "w2", 1000).await.unwrap().is_none());

        time.advance(1001);
        let reclaimed = store.claim_next("note-processing", "w2", 1000).await.unwrap().unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
        assert_eq!(
            reclaimed.error_details.unwrap()["timeoutType"],
            serde_json::json!("lease_expired")
        );

        // The old owner can neither renew nor complete
        assert!(!store.renew_lease(&reclaimed.id, "w1", 1000).await.unwrap());
        assert!(store
            .transition(&reclaimed.id, Some("w1"), &Transition::Complete)
            .await
            .unwrap()
            .is_none());
        assert!(store.renew_lease(&reclaimed.id, "w2", 1000).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_status_guard() {
        let (store, time) = setup_test_db().await;
        store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        let id = "j1".to_string();

        // Complete is not allowed from pending
        assert!(store.transition(&id, None, &Transition::Complete).await.unwrap().is_none());

        store.claim_next("note-processing", "w1", 1000).await.unwrap();
        let retry = Transition::Retry {
            retry_count: 1,
            retry_at: time.now_millis() + 500,
            failure: JobFailure::new("flaky"),
        };
        let updated = store.transition(&id, Some("w1"), &retry).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::RetryPending);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.next_retry_at, Some(time.now_millis() + 500));
        assert_eq!(updated.scheduled_for, time.now_millis() + 500);
        assert_eq!(updated.error_message.as_deref(), Some("flaky"));
        assert!(updated.locked_by.is_none());

        let requeued = store
            .transition(&id, None, &Transition::Requeue { retry_count: 0 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.scheduled_for, time.now_millis());
        assert!(requeued.error_message.is_none());
    }

    #[tokio::test]
    async fn test_save_progress_keeps_lease() {
        let (store, time) = setup_test_db().await;
        store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        store.claim_next("note-processing", "w1", 1000).await.unwrap();

        let mut stage = Stage::new("fetch");
        stage.status = StageStatus::Completed;
        stage.progress = 100;
        let update = ProgressUpdate {
            stages: vec![stage.clone(), Stage::new("embed")],
            overall_progress: 50,
            current_stage: Some("embed".into()),
            status: None,
            error_message: None,
            completed_at: None,
        };
        let saved = store
            .save_progress(&"j1".to_string(), Some("w1"), &update)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(saved.stages.len(), 2);
        assert_eq!(saved.stages[0], stage);
        assert_eq!(saved.overall_progress, 50);
        assert_eq!(saved.status, JobStatus::Processing);
        assert_eq!(saved.locked_by.as_deref(), Some("w1"));
        assert!(store
            .save_progress(&"nope".to_string(), None, &update)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_save_progress_rejects_superseded_worker() {
        let (store, time) = setup_test_db().await;
        store.upsert(&job(&time, "j1", "n1")).await.unwrap();
        store.claim_next("note-processing", "w-old", 1000).await.unwrap();

        // Re-enqueue resets the row while w-old is still running
        store.upsert(&job(&time, "j1-again", "n1")).await.unwrap();

        let update = ProgressUpdate {
            stages: vec![Stage::new("fetch")],
            overall_progress: 100,
            current_stage: None,
            status: Some(JobStatus::Completed),
            error_message: None,
            completed_at: Some(time.now_millis()),
        };
        let stale = store
            .save_progress(&"j1".to_string(), Some("w-old"), &update)
            .await
            .unwrap();
        assert!(stale.is_none(), "superseded worker must not write");

        let row = store.find_by_id(&"j1".to_string()).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.overall_progress, 0);

        let reclaimed = store.claim_next("note-processing", "w-new", 1000).await.unwrap();
        assert_eq!(reclaimed.map(|j| j.id), Some("j1".to_string()));
    }

    #[tokio::test]
    async fn test_expire_abandoned_only_when_exhausted() {
        let (store, time) = setup_test_db().await;
        let mut exhausted = job(&time, "j1", "n1");
        exhausted.max_retries = 0;
        store.upsert(&exhausted).await.unwrap();
        store.upsert(&job(&time, "j2", "n2")).await.unwrap();
        store.claim_next("note-processing", "w1", 1000).await.unwrap();
        store.claim_next("note-processing", "w1", 1000).await.unwrap();

        assert!(store.expire_abandoned().await.unwrap().is_empty());
        time.advance(2000);
        let failed = store.expire_abandoned().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "j1");
        assert_eq!(failed[0].status, JobStatus::Failed);
        assert!(failed[0].locked_by.is_none());
    }

    #[tokio::test]
    async fn test_counts() {
        let (store, time) = setup_test_db().await;
        let mut exec = job(&time, "j1", "n1");
        exec.job_type = Some("execution".into());
        store.upsert(&exec).await.unwrap();
        time.advance(1);
        store.upsert(&job(&time, "j2", "n2")).await.unwrap();
        let claimed = store.claim_next("note-processing", "w1", 1000).await.unwrap().unwrap();
        store.transition(&claimed.id, Some("w1"), &Transition::Complete).await.unwrap();

        let summary = store.status_counts("u1").await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.total(), 2);

        assert_eq!(
            store.count_completed("note-processing", "n1", Some("execution")).await.unwrap(),
            1
        );
        assert_eq!(store.count_completed("note-processing", "n1", None).await.unwrap(), 1);
        assert_eq!(
            store.count_completed("note-processing", "n1", Some("other")).await.unwrap(),
            0
        );
    }
}
