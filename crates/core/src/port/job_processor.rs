// Job Processor Port
// Pluggable per-queue job logic, invoked by workers

use crate::application::progress::StageTracker;
use crate::domain::Job;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Everything a processor gets for one attempt
#[derive(Clone)]
pub struct JobContext {
    pub job: Job,
    pub worker_id: String,
    pub tracker: Arc<StageTracker>,
}

/// Rate governor partition for a job (e.g. the bookmark's hostname)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub key: String,
    /// Processing strategy sub-key for handler-specific rules
    pub handler: Option<String>,
}

impl Partition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }
}

/// Processing outcome errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// Job logic failed; retried with backoff while attempts remain
    #[error("{message}")]
    Failed {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Destination throttled us; rescheduled without consuming a retry.
    /// `block_for_ms` additionally blocks the partition in the governor.
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        retry_after_ms: i64,
        block_for_ms: Option<i64>,
    },

    /// Bad payload; terminal, never retried
    #[error("Invalid job: {0}")]
    Invalid(String),
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed {
            message: message.into(),
            details: None,
        }
    }

    pub fn rate_limited(retry_after_ms: i64) -> Self {
        ProcessError::RateLimited {
            retry_after_ms,
            block_for_ms: None,
        }
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Governor partition for the job. None bypasses admission control.
    fn partition(&self, _job: &Job) -> Option<Partition> {
        None
    }

    /// Run one attempt. Stage progress is reported through `ctx.tracker`.
    async fn process(&self, ctx: JobContext) -> Result<(), ProcessError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        Success,
        Fail(String),
        Invalid(String),
        RateLimited(i64),
        /// Panic with message (for panic isolation testing)
        Panic(String),
    }

    pub struct MockProcessor {
        behavior: Mutex<MockBehavior>,
        stages: Vec<String>,
        partition: Option<Partition>,
        call_count: AtomicUsize,
    }

    impl MockProcessor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                stages: Vec::new(),
                partition: None,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        /// Initialize and complete these stages on success
        pub fn with_stages(mut self, stages: &[&str]) -> Self {
            self.stages = stages.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn with_partition(mut self, partition: Partition) -> Self {
            self.partition = Some(partition);
            self
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobProcessor for MockProcessor {
        fn partition(&self, _job: &Job) -> Option<Partition> {
            self.partition.clone()
        }

        async fn process(&self, ctx: JobContext) -> Result<(), ProcessError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().unwrap().clone();

            match behavior {
                MockBehavior::Success => {
                    if !self.stages.is_empty() {
                        let names: Vec<&str> = self.stages.iter().map(|s| s.as_str()).collect();
                        ctx.tracker
                            .initialize_job(&ctx.job.id, &names)
                            .await
                            .map_err(|e| ProcessError::failed(e.to_string()))?;
                        for name in &names {
                            ctx.tracker
                                .complete_stage(&ctx.job.id, name)
                                .await
                                .map_err(|e| ProcessError::failed(e.to_string()))?;
                        }
                    }
                    Ok(())
                }
                MockBehavior::Fail(msg) => Err(ProcessError::failed(msg)),
                MockBehavior::Invalid(msg) => Err(ProcessError::Invalid(msg)),
                MockBehavior::RateLimited(ms) => Err(ProcessError::rate_limited(ms)),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg);
                }
            }
        }
    }
}
