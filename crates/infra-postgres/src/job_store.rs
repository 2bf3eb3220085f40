// PostgreSQL JobStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use cairn_core::domain::{
    Job, JobFailure, JobId, JobPayload, JobStatus, JobSummary, Stage, Transition,
};
use cairn_core::error::Result;
use cairn_core::port::{JobStore, ProgressUpdate, TimeProvider};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PgJobStore {
    pool: PgPool,
    time_provider: Arc<dyn TimeProvider>,
}

impl PgJobStore {
    pub fn new(pool: PgPool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_failure(qb: &mut QueryBuilder<'_, Postgres>, failure: &JobFailure) {
    qb.push(", error_message = ")
        .push_bind(failure.message.clone());
    qb.push(", error_details = ")
        .push_bind(failure.details.clone());
}

/// Conditional UPDATE for a transition: status guard from `allowed_from`,
/// optional lease-owner guard, lease always released
fn transition_query(
    id: &str,
    lease_owner: Option<&str>,
    transition: &Transition,
    now: i64,
) -> QueryBuilder<'static, Postgres> {
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

    let allowed: Vec<String> = transition
        .allowed_from()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    qb.push(" WHERE id = ").push_bind(id.to_string());
    qb.push(" AND status = ANY(").push_bind(allowed).push(")");
    if let Some(owner) = lease_owner {
        qb.push(" AND locked_by = ").push_bind(owner.to_string());
    }
    qb.push(" RETURNING *");
    qb
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(&self, job: &Job) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, queue, dedup_key, job_type, asset_id, user_id, payload,
                status, stages, overall_progress, retry_count, max_retries,
                scheduled_for, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', '[]'::jsonb, 0, 0, $8, $9, $10, $11)
            ON CONFLICT ON CONSTRAINT jobs_queue_dedup_key DO UPDATE SET
                job_type = EXCLUDED.job_type,
                asset_id = EXCLUDED.asset_id,
                user_id = EXCLUDED.user_id,
                payload = EXCLUDED.payload,
                status = 'pending',
                stages = '[]'::jsonb,
                current_stage = NULL,
                overall_progress = 0,
                error_message = NULL,
                error_details = NULL,
                retry_count = 0,
                max_retries = EXCLUDED.max_retries,
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                scheduled_for = EXCLUDED.scheduled_for,
                next_retry_at = NULL,
                updated_at = EXCLUDED.updated_at,
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
        .bind(job.payload.as_value())
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
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_by_key(&self, queue: &str, dedup_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE queue = $1 AND dedup_key = $2",
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

        // FOR UPDATE SKIP LOCKED: concurrent claimers never pick the same row.
        // SET expressions see the pre-update row, so `status = 'processing'`
        // identifies a reclaim of an expired lease.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET retry_count = CASE WHEN status = 'processing' THEN retry_count + 1 ELSE retry_count END,
                error_details = CASE WHEN status = 'processing'
                    THEN '{"timeoutType":"lease_expired"}'::jsonb ELSE error_details END,
                status = 'processing',
                locked_by = $2,
                locked_at = $1,
                expires_at = $3,
                updated_at = $1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $4
                  AND (
                      (status IN ('pending', 'retry_pending')
                          AND scheduled_for <= $1
                          AND (locked_by IS NULL OR expires_at < $1))
                      OR (status = 'processing' AND expires_at < $1 AND retry_count < max_retries)
                  )
                ORDER BY scheduled_for ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
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
            UPDATE jobs SET expires_at = $1, updated_at = $2
            WHERE id = $3 AND status = 'processing' AND locked_by = $4
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
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET stages = $1,
                overall_progress = $2,
                current_stage = $3,
                status = COALESCE($4, status),
                error_message = COALESCE($5, error_message),
                completed_at = COALESCE($6, completed_at),
                updated_at = $7
            WHERE id = $8
              AND ($9::TEXT IS NULL
                   OR (locked_by = $9 AND status IN ('processing', 'completed', 'failed')))
            RETURNING *
            "#,
        )
        .bind(Json(&update.stages))
        .bind(update.overall_progress)
        .bind(&update.current_stage)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.error_message)
        .bind(update.completed_at)
        .bind(self.time_provider.now_millis())
        .bind(id)
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
            WHERE queue = $1 AND status IN ('pending', 'retry_pending') AND scheduled_for > $2
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
                error_message = $1,
                error_details = $2,
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                updated_at = $3
            WHERE status = 'processing' AND expires_at < $3 AND retry_count >= max_retries
            RETURNING *
            "#,
        )
        .bind(&failure.message)
        .bind(&failure.details)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn status_counts(&self, user_id: &str) -> Result<JobSummary> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE user_id = $1 GROUP BY status",
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
            WHERE queue = $1 AND asset_id = $2 AND status = 'completed'
              AND ($3::text IS NULL OR job_type = $3)
            "#,
        )
        .bind(queue)
        .bind(asset_id)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    dedup_key: String,
    job_type: Option<String>,
    asset_id: String,
    user_id: String,
    payload: serde_json::Value,

    status: String,
    stages: Json<Vec<Stage>>,
    current_stage: Option<String>,
    overall_progress: i32,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,

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
        Ok(Job {
            status: self.status.parse()?,
            id: self.id,
            queue: self.queue,
            dedup_key: self.dedup_key,
            job_type: self.job_type,
            asset_id: self.asset_id,
            user_id: self.user_id,
            payload: JobPayload::new(self.payload),
            stages: self.stages.0,
            current_stage: self.current_stage,
            overall_progress: self.overall_progress,
            error_message: self.error_message,
            error_details: self.error_details,
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
    use crate::{create_pool, run_migrations, TEST_URL_ENV};
    use cairn_core::port::time_provider::mocks::MockTimeProvider;

    async fn setup() -> Option<(PgJobStore, Arc<MockTimeProvider>)> {
        let Ok(url) = std::env::var(TEST_URL_ENV) else {
            eprintln!("{} not set, skipping", TEST_URL_ENV);
            return None;
        };
        let pool = create_pool(&url, 4).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let time = Arc::new(MockTimeProvider::new(1_000_000));
        Some((PgJobStore::new(pool, time.clone()), time))
    }

    /// Names unique across runs against a shared database
    fn unique(prefix: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let run = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        format!("{}-{}-{}", prefix, run, COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test]
    #[ignore = "requires CAIRN_TEST_POSTGRES_URL"]
    async fn test_claim_retry_complete_round() {
        let Some((store, time)) = setup().await else {
            return;
        };
        let queue = unique("pg-test");
        let job = Job::new(
            unique("job"),
            time.now_millis(),
            queue.clone(),
            "k1",
            "a1",
            "u1",
            JobPayload::new(serde_json::json!({"n": 1})),
        );
        store.upsert(&job).await.unwrap();

        let claimed = store.claim_next(&queue, "w1", 1000).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(store.claim_next(&queue, "w2", 1000).await.unwrap().is_none());

        time.advance(1001);
        let reclaimed = store.claim_next(&queue, "w2", 1000).await.unwrap().unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(
            reclaimed.error_details.unwrap()["timeoutType"],
            serde_json::json!("lease_expired")
        );

        assert!(store
            .transition(&job.id, Some("w1"), &Transition::Complete)
            .await
            .unwrap()
            .is_none());
        let done = store
            .transition(&job.id, Some("w2"), &Transition::Complete)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.count_completed(&queue, "a1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires CAIRN_TEST_POSTGRES_URL"]
    async fn test_concurrent_claims_are_exclusive() {
        let Some((store, time)) = setup().await else {
            return;
        };
        let store = Arc::new(store);
        let queue = unique("pg-race");
        for i in 0..10 {
            let job = Job::new(
                unique("job"),
                time.now_millis(),
                queue.clone(),
                format!("k{}", i),
                "a1",
                "u1",
                JobPayload::new(serde_json::json!({})),
            );
            store.upsert(&job).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..5 {
            let store = Arc::clone(&store);
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim_next(&queue, &format!("w{}", w), 60_000)
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 10);
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    #[ignore = "requires CAIRN_TEST_POSTGRES_URL"]
    async fn test_save_progress_requires_lease_owner() {
        let Some((store, time)) = setup().await else {
            return;
        };
        let queue = unique("pg-progress");
        let job = Job::new(
            unique("job"),
            time.now_millis(),
            queue.clone(),
            "k1",
            "a1",
            "u1",
            JobPayload::new(serde_json::json!({})),
        );
        store.upsert(&job).await.unwrap();
        store.claim_next(&queue, "w-old", 60_000).await.unwrap().unwrap();

        let update = ProgressUpdate {
            stages: Vec::new(),
            overall_progress: 40,
            current_stage: None,
            status: None,
            error_message: None,
            completed_at: None,
        };
        let saved = store
            .save_progress(&job.id, Some("w-old"), &update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.overall_progress, 40);

        // Re-enqueue drops the lease; the old attempt can no longer write
        let again = Job::new(
            unique("job"),
            time.now_millis(),
            queue.clone(),
            "k1",
            "a1",
            "u1",
            JobPayload::new(serde_json::json!({})),
        );
        store.upsert(&again).await.unwrap();
        let completed = ProgressUpdate {
            overall_progress: 100,
            status: Some(JobStatus::Completed),
            completed_at: Some(time.now_millis()),
            ..update
        };
        assert!(store
            .save_progress(&job.id, Some("w-old"), &completed)
            .await
            .unwrap()
            .is_none());
        let row = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(store.claim_next(&queue, "w-new", 60_000).await.unwrap().is_some());
    }
}
