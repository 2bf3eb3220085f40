// Redis JobStore Implementation
//
// Broker-native job store: one hash per job, one sorted set per queue state,
// and Lua scripts so that every conditional update is a single round trip.

use crate::error::map_redis_error;
use crate::record::{job_fields, job_from_hash, progress_fields, transition_fields, FieldUpdate};
use crate::scripts::Scripts;
use async_trait::async_trait;
use cairn_core::domain::{Job, JobFailure, JobId, JobStatus, JobSummary, Transition};
use cairn_core::error::Result;
use cairn_core::port::{JobStore, ProgressUpdate, TimeProvider, OWNED_PROGRESS_STATUSES};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hash-tagged so every key of a store maps to one Redis Cluster slot
pub const DEFAULT_KEY_PREFIX: &str = "{cairn}";

/// Separator between asset id and job type in the completions hash
const COMPLETION_FIELD_SEPARATOR: char = '\u{1f}';

fn completion_field(asset_id: &str, job_type: Option<&str>) -> String {
    match job_type {
        Some(job_type) => format!("{}{}{}", asset_id, COMPLETION_FIELD_SEPARATOR, job_type),
        None => asset_id.to_string(),
    }
}

// Key layout shared with the Lua scripts (see scripts.rs)
fn job_key(prefix: &str, id: &str) -> String {
    format!("{}:job:{}", prefix, id)
}

fn queue_key(prefix: &str, queue: &str, set: &str) -> String {
    format!("{}:{}:{}", prefix, queue, set)
}

fn user_key(prefix: &str, user_id: &str) -> String {
    format!("{}:user:{}:jobs", prefix, user_id)
}

fn queues_key(prefix: &str) -> String {
    format!("{}:queues", prefix)
}

/// The `{...}` section Redis Cluster hashes a key by, if any
fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let close = open + 1 + key[open + 1..].find('}')?;
    let tag = &key[open + 1..close];
    (!tag.is_empty()).then_some(tag)
}

/// Retention for finished jobs. Failed jobs are kept for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Completed rows expire after this long
    pub completed_ttl: Duration,
    /// Per-queue cap on completed rows (oldest evicted first)
    pub completed_cap: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            completed_cap: 1000,
        }
    }
}

pub struct RedisJobStore {
    conn: ConnectionManager,
    time_provider: Arc<dyn TimeProvider>,
    scripts: Scripts,
    prefix: String,
    retention: Retention,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            conn,
            time_provider,
            scripts: Scripts::load(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention: Retention::default(),
        }
    }

    /// Key prefix. Keep a `{...}` hash tag in it when running on Redis Cluster.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        if hash_tag(&self.prefix).is_none() {
            warn!(prefix = %self.prefix, "Key prefix has no hash tag; store is not cluster safe");
        }
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    fn job_key(&self, id: &str) -> String {
        job_key(&self.prefix, id)
    }

    fn queue_key(&self, queue: &str, set: &str) -> String {
        queue_key(&self.prefix, queue, set)
    }

    /// Common leading script arguments
    fn invocation<'a>(&self, script: &'a redis::Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(self.retention.completed_ttl.as_secs().max(1))
            .arg(self.retention.completed_cap);
        invocation
    }

    async fn guarded_update(
        &self,
        id: &str,
        lease_owner: Option<&str>,
        allowed: &[JobStatus],
        update: &FieldUpdate,
    ) -> Result<Option<Job>> {
        let allowed = allowed
            .iter()
            .map(JobStatus::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let mut invocation = self.invocation(&self.scripts.update);
        invocation.arg(id).arg(lease_owner.unwrap_or("")).arg(allowed);
        for arg in update.to_args() {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let row: Option<HashMap<String, String>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        row.map(job_from_hash).transpose()
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(queues_key(&self.prefix))
            .await
            .map_err(map_redis_error)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn upsert(&self, job: &Job) -> Result<Job> {
        let mut invocation = self.invocation(&self.scripts.upsert);
        invocation.arg(&job.queue).arg(&job.dedup_key).arg(&job.id);

        let fields = job_fields(job)?;
        invocation.arg(fields.len());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        invocation.arg(0);

        let mut conn = self.conn.clone();
        let row: HashMap<String, String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let stored = job_from_hash(row)?;
        debug!(job_id = %stored.id, queue = %stored.queue, "Job upserted");
        Ok(stored)
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let row: HashMap<String, String> = conn
            .hgetall(self.job_key(id))
            .await
            .map_err(map_redis_error)?;
        if row.is_empty() {
            return Ok(None);
        }
        job_from_hash(row).map(Some)
    }

    async fn find_by_key(&self, queue: &str, dedup_key: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .hget(self.queue_key(queue, "dedup"), dedup_key)
            .await
            .map_err(map_redis_error)?;
        match id {
            Some(id) => self.find_by_id(&id).await,
            None => Ok(None),
        }
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();
        let marker = JobFailure::timeout("lease expired", "lease_expired")
            .details
            .map(|d| d.to_string())
            .unwrap_or_default();

        let mut invocation = self.invocation(&self.scripts.claim);
        invocation
            .arg(queue)
            .arg(now)
            .arg(worker_id)
            .arg(now + lease_ms)
            .arg(marker);

        let mut conn = self.conn.clone();
        let row: Option<HashMap<String, String>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        row.map(job_from_hash).transpose()
    }

    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let update = FieldUpdate {
            set: vec![
                ("expires_at", (now + lease_ms).to_string()),
                ("updated_at", now.to_string()),
            ],
            clear: Vec::new(),
        };
        let renewed = self
            .guarded_update(id, Some(worker_id), &[JobStatus::Processing], &update)
            .await?;
        Ok(renewed.is_some())
    }

    async fn transition(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        transition: &Transition,
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();
        let update = transition_fields(transition, now)?;
        let job = self
            .guarded_update(id, lease_owner, transition.allowed_from(), &update)
            .await?;
        if job.is_none() {
            debug!(job_id = %id, target = %transition.target(), "Transition guard failed");
        }
        Ok(job)
    }

    async fn save_progress(
        &self,
        id: &JobId,
        lease_owner: Option<&str>,
        update: &ProgressUpdate,
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();
        let fields = progress_fields(update, now)?;
        let allowed: &[JobStatus] = if lease_owner.is_some() {
            OWNED_PROGRESS_STATUSES
        } else {
            &[]
        };
        self.guarded_update(id, lease_owner, allowed, &fields).await
    }

    async fn earliest_scheduled_after(
        &self,
        queue: &str,
        after_millis: i64,
    ) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let first: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.queue_key(queue, "waiting"))
            .arg(format!("({}", after_millis))
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(first.first().map(|(_, score)| *score as i64))
    }

    async fn expire_abandoned(&self) -> Result<Vec<Job>> {
        let now = self.time_provider.now_millis();
        let failure = JobFailure::timeout("lease expired with no retries left", "lease_expired");
        let details = failure
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();

        let mut expired = Vec::new();
        for queue in self.queues().await? {
            let mut invocation = self.invocation(&self.scripts.expire);
            invocation
                .arg(&queue)
                .arg(now)
                .arg(&failure.message)
                .arg(&details);

            let mut conn = self.conn.clone();
            let ids: Vec<String> = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            for id in ids {
                if let Some(job) = self.find_by_id(&id).await? {
                    expired.push(job);
                }
            }
        }
        Ok(expired)
    }

    async fn status_counts(&self, user_id: &str) -> Result<JobSummary> {
        let user_key = user_key(&self.prefix, user_id);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(&user_key).await.map_err(map_redis_error)?;
        if ids.is_empty() {
            return Ok(JobSummary::default());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.job_key(id), "status");
        }
        let statuses: Vec<Option<String>> =
            pipe.query_async(&mut conn).await.map_err(map_redis_error)?;

        let mut summary = JobSummary::default();
        let mut gone = Vec::new();
        for (id, status) in ids.iter().zip(statuses) {
            match status.as_deref().map(str::parse::<JobStatus>) {
                Some(Ok(status)) => summary.add(status, 1),
                Some(Err(e)) => warn!(job_id = %id, error = %e, "Skipping unknown status in summary"),
                // Expired or evicted by retention
                None => gone.push(id.clone()),
            }
        }
        if !gone.is_empty() {
            let _: i64 = conn.srem(&user_key, gone).await.map_err(map_redis_error)?;
        }
        Ok(summary)
    }

    /// Read from the durable completions counter, so rows dropped by
    /// retention still count
    async fn count_completed(
        &self,
        queue: &str,
        asset_id: &str,
        job_type: Option<&str>,
    ) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn
            .hget(
                self.queue_key(queue, "completions"),
                completion_field(asset_id, job_type),
            )
            .await
            .map_err(map_redis_error)?;
        Ok(count.unwrap_or(0))
    }

    async fn close(&self) {
        // ConnectionManager closes when the last clone drops
        debug!("Redis job store closed");
    }
}
