// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::stage::Stage;
use serde::{Deserialize, Serialize};

/// Job ID (UUID v7, generated at enqueue time)
pub type JobId = String;

/// Queue identifier (one queue per asset/job type, e.g. "bookmark-processing")
pub type QueueId = String;

/// Default retry budget for new jobs
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RetryPending,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::RetryPending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RetryPending => "retry_pending",
        }
    }

    /// Claimable statuses (subject to schedule and lease checks)
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::RetryPending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retry_pending" => Ok(JobStatus::RetryPending),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Job Payload (opaque to the core; only producers/processors interpret it)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(serde_json::Value);

impl JobPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Nesting depth of the payload (scalars are depth 0)
    pub fn depth(&self) -> usize {
        fn depth_of(value: &serde_json::Value) -> usize {
            match value {
                serde_json::Value::Array(items) => {
                    1 + items.iter().map(depth_of).max().unwrap_or(0)
                }
                serde_json::Value::Object(map) => {
                    1 + map.values().map(depth_of).max().unwrap_or(0)
                }
                _ => 0,
            }
        }
        depth_of(&self.0)
    }
}

/// Failure record written into `error_message` / `error_details`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Failure caused by a timeout, tagged with a `timeoutType` marker
    pub fn timeout(message: impl Into<String>, timeout_type: &str) -> Self {
        Self::new(message).with_details(serde_json::json!({ "timeoutType": timeout_type }))
    }
}

/// Job Entity (durable record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    // Identity & classification
    pub id: JobId,
    pub queue: QueueId,
    pub dedup_key: String,
    pub job_type: Option<String>,
    pub asset_id: String,
    pub user_id: String,
    pub payload: JobPayload,

    // Status & progress
    pub status: JobStatus,
    pub stages: Vec<Stage>,
    pub current_stage: Option<String>,
    pub overall_progress: i32,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,

    // Attempt tracking
    pub retry_count: i32,
    pub max_retries: i32,

    // Lease
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub expires_at: Option<i64>,

    // Scheduling (epoch ms)
    pub scheduled_for: i64,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Job {
    /// Create a new pending job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `now_millis` - Creation timestamp in epoch ms (injected, not system time)
    /// * `queue` - Queue name
    /// * `dedup_key` - Deduplication key, unique per queue
    /// * `asset_id` - ID of the content entity the job works on
    /// * `user_id` - Owner of the asset (events are routed to this user)
    /// * `payload` - Opaque job payload
    pub fn new(
        id: impl Into<String>,
        now_millis: i64,
        queue: impl Into<String>,
        dedup_key: impl Into<String>,
        asset_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            dedup_key: dedup_key.into(),
            job_type: None,
            asset_id: asset_id.into(),
            user_id: user_id.into(),
            payload,
            status: JobStatus::Pending,
            stages: Vec::new(),
            current_stage: None,
            overall_progress: 0,
            error_message: None,
            error_details: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            locked_by: None,
            locked_at: None,
            expires_at: None,
            scheduled_for: now_millis,
            next_retry_at: None,
            created_at: now_millis,
            updated_at: now_millis,
            completed_at: None,
        }
    }

    /// Create a test job with deterministic ID and timestamp.
    ///
    /// Uses a simple counter for deterministic test IDs (test-1, test-2, ...).
    /// Timestamps start at 1000 and increment by 1000.
    ///
    /// **Note**: This method should only be used in tests. Production code
    /// injects ID and time via providers.
    pub fn new_test(queue: impl Into<String>, dedup_key: impl Into<String>) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let id = format!("test-{}", counter);
        let created_at = (counter * 1000) as i64;

        Self::new(
            id,
            created_at,
            queue,
            dedup_key,
            format!("asset-{}", counter),
            "user-test",
            JobPayload::new(serde_json::json!({})),
        )
    }

    /// Failed with retry budget left (operator may retry without forcing)
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Completed, or failed with no retries left
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }

    fn lease_expired_at(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|expires| expires < now_millis)
    }

    /// Claim predicate. Stores evaluate the same condition atomically with the claim.
    ///
    /// A due pending/retry_pending job with no live lease is claimable. So is a
    /// processing job whose lease expired, while it still has attempts left.
    pub fn is_claimable_at(&self, now_millis: i64) -> bool {
        let fresh = self.status.is_claimable()
            && self.scheduled_for <= now_millis
            && (self.locked_by.is_none() || self.lease_expired_at(now_millis));
        fresh || self.is_reclaimable_at(now_millis)
    }

    /// Processing job with an expired lease and attempts left
    pub fn is_reclaimable_at(&self, now_millis: i64) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expired_at(now_millis)
            && self.retry_count < self.max_retries
    }

    /// Processing job with an expired lease and no attempts left
    pub fn is_abandoned_at(&self, now_millis: i64) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expired_at(now_millis)
            && self.retry_count >= self.max_retries
    }

    /// Apply a state transition in memory.
    ///
    /// Stores enforce the same `allowed_from` guard in their conditional
    /// updates; this is the reference implementation.
    pub fn apply(&mut self, transition: &Transition, now_millis: i64) -> Result<()> {
        if !transition.allowed_from().contains(&self.status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: transition.target().to_string(),
            });
        }

        match transition {
            Transition::Complete => {
                self.completed_at = Some(now_millis);
                self.error_message = None;
                self.error_details = None;
            }
            Transition::Retry {
                retry_count,
                retry_at,
                failure,
            } => {
                self.retry_count = *retry_count;
                self.next_retry_at = Some(*retry_at);
                self.scheduled_for = *retry_at;
                self.set_failure(failure);
            }
            Transition::Reschedule { run_at } => {
                self.scheduled_for = *run_at;
                self.next_retry_at = None;
            }
            Transition::Fail { failure } => {
                self.set_failure(failure);
            }
            Transition::Requeue { retry_count } => {
                self.retry_count = *retry_count;
                self.scheduled_for = now_millis;
                self.next_retry_at = None;
                self.completed_at = None;
                self.error_message = None;
                self.error_details = None;
            }
        }

        self.status = transition.target();
        self.locked_by = None;
        self.locked_at = None;
        self.expires_at = None;
        self.updated_at = now_millis;
        Ok(())
    }

    fn set_failure(&mut self, failure: &JobFailure) {
        self.error_message = Some(failure.message.clone());
        self.error_details = failure.details.clone();
    }
}

/// Lease-releasing state transitions applied by workers, sweeps, and operators
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// processing -> completed
    Complete,
    /// processing -> retry_pending with backoff
    Retry {
        retry_count: i32,
        retry_at: i64,
        failure: JobFailure,
    },
    /// Rate-limited: run later without consuming a retry
    Reschedule { run_at: i64 },
    /// Terminal (or operator-retryable) failure
    Fail { failure: JobFailure },
    /// Operator retry / forced re-run
    Requeue { retry_count: i32 },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Complete => JobStatus::Completed,
            Transition::Retry { .. } | Transition::Requeue { .. } => JobStatus::RetryPending,
            Transition::Reschedule { .. } => JobStatus::Pending,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    /// Statuses the job must currently be in for the transition to apply
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            // The stage tracker may already have marked the job completed/failed
            Transition::Complete => &[Processing, Completed],
            Transition::Retry { .. } => &[Processing, Failed],
            Transition::Reschedule { .. } => &[Processing, Pending, RetryPending],
            Transition::Fail { .. } => &[Processing, Pending, RetryPending, Failed],
            Transition::Requeue { .. } => &[Pending, Processing, Completed, Failed, RetryPending],
        }
    }
}
