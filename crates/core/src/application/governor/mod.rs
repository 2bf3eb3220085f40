// Rate/Concurrency Governor - per-partition admission control
//
// State is process-local: each process enforces its limits independently.

mod rules;

pub use rules::{RateRule, RateRules};

use crate::application::worker::ShutdownToken;
use crate::port::TimeProvider;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry-after for concurrency rejections (5s)
pub const CONCURRENCY_RETRY_MS: i64 = 5_000;

/// Running slots with no completion in this window are considered stale (10min)
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 10 * 60 * 1000;

/// Default partition block duration (1h)
pub const DEFAULT_BLOCK_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub rules: RateRules,
    pub stale_threshold_ms: i64,
    pub default_block_ms: i64,
    pub concurrency_retry_ms: i64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rules: RateRules::default(),
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            default_block_ms: DEFAULT_BLOCK_MS,
            concurrency_retry_ms: CONCURRENCY_RETRY_MS,
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub can_process: bool,
    /// How long to wait before trying again (0 when admitted)
    pub delay_ms: i64,
    pub blocked: bool,
    pub reason: Option<String>,
}

impl Admission {
    fn admit() -> Self {
        Self {
            can_process: true,
            delay_ms: 0,
            blocked: false,
            reason: None,
        }
    }

    fn reject(delay_ms: i64, reason: impl Into<String>) -> Self {
        Self {
            can_process: false,
            delay_ms,
            blocked: false,
            reason: Some(reason.into()),
        }
    }
}

/// Jobs evicted from a partition's running set by the stale sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSlot {
    pub partition: String,
    pub job_ids: Vec<String>,
}

/// Invoked for each stale slot so the jobs can be failed durably
pub type StaleCallback = Arc<dyn Fn(StaleSlot) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default)]
struct DomainState {
    last_processed_at: Option<i64>,
    last_completed_at: Option<i64>,
    /// job id -> processing start
    running: HashMap<String, i64>,
    blocked_until: Option<i64>,
    blocked_reason: Option<String>,
}

#[derive(Debug, Default)]
struct GovernorState {
    domains: HashMap<String, DomainState>,
    last_global_at: Option<i64>,
}

pub struct DomainRateLimiter {
    config: GovernorConfig,
    time: Arc<dyn TimeProvider>,
    state: Mutex<GovernorState>,
}

impl DomainRateLimiter {
    pub fn new(config: GovernorConfig, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            config,
            time,
            state: Mutex::new(GovernorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rule_for(&self, key: &str, handler: Option<&str>) -> RateRule {
        self.config.rules.resolve(key, handler)
    }

    /// Admission check without side effects (apart from clearing an expired block)
    pub fn check(&self, key: &str, handler: Option<&str>) -> Admission {
        let now = self.time.now_millis();
        let rule = self.rule_for(key, handler);
        let mut state = self.lock();
        self.evaluate(&mut state, key, rule, now)
    }

    /// `check` followed by `mark_processing` under one lock
    pub fn try_acquire(&self, key: &str, handler: Option<&str>, job_id: &str) -> Admission {
        let now = self.time.now_millis();
        let rule = self.rule_for(key, handler);
        let mut state = self.lock();
        let admission = self.evaluate(&mut state, key, rule, now);
        if admission.can_process {
            Self::record_start(&mut state, key, job_id, now);
        } else {
            debug!(
                partition = key,
                job_id,
                delay_ms = admission.delay_ms,
                reason = ?admission.reason,
                "Admission denied"
            );
        }
        admission
    }

    fn evaluate(
        &self,
        state: &mut GovernorState,
        key: &str,
        rule: RateRule,
        now: i64,
    ) -> Admission {
        let global_ready_at = state
            .last_global_at
            .map(|at| at + self.config.rules.global_delay());
        let domain = state.domains.entry(key.to_string()).or_default();

        // 1. Circuit breaker, cleared lazily once expired
        if let Some(until) = domain.blocked_until {
            if until > now {
                return Admission {
                    can_process: false,
                    delay_ms: until - now,
                    blocked: true,
                    reason: domain.blocked_reason.clone(),
                };
            }
            info!(partition = key, "Partition block expired");
            domain.blocked_until = None;
            domain.blocked_reason = None;
        }

        // 2. Concurrency cap
        if domain.running.len() >= rule.max_concurrent {
            return Admission::reject(
                self.config.concurrency_retry_ms,
                format!(
                    "concurrency limit reached ({}/{})",
                    domain.running.len(),
                    rule.max_concurrent
                ),
            );
        }

        // 3. Global then per-partition delay; the larger wait wins
        let global_wait = global_ready_at.map_or(0, |at| at - now);
        let partition_wait = domain
            .last_processed_at
            .map_or(0, |at| at + rule.delay_ms - now);
        let wait = global_wait.max(partition_wait);
        if wait > 0 {
            return Admission::reject(wait, "rate delay not elapsed");
        }

        Admission::admit()
    }

    fn record_start(state: &mut GovernorState, key: &str, job_id: &str, now: i64) {
        let domain = state.domains.entry(key.to_string()).or_default();
        domain.running.insert(job_id.to_string(), now);
        domain.last_processed_at = Some(now);
        state.last_global_at = Some(now);
    }

    /// Record a processing start (also advances the global timestamp)
    pub fn mark_processing(&self, key: &str, job_id: &str) {
        let now = self.time.now_millis();
        Self::record_start(&mut self.lock(), key, job_id, now);
    }

    /// Free the job's slot. Delay timing stays anchored at processing start.
    pub fn mark_complete(&self, key: &str, job_id: &str) {
        let now = self.time.now_millis();
        let mut state = self.lock();
        if let Some(domain) = state.domains.get_mut(key) {
            domain.running.remove(job_id);
            domain.last_completed_at = Some(now);
        }
    }

    /// Block a partition for `duration_ms` (default 1h)
    pub fn block(&self, key: &str, duration_ms: Option<i64>, reason: impl Into<String>) {
        let now = self.time.now_millis();
        let duration_ms = duration_ms.unwrap_or(self.config.default_block_ms);
        let reason = reason.into();
        warn!(partition = key, duration_ms, reason = %reason, "Blocking partition");

        let mut state = self.lock();
        let domain = state.domains.entry(key.to_string()).or_default();
        domain.blocked_until = Some(now + duration_ms);
        domain.blocked_reason = Some(reason);
    }

    pub fn unblock(&self, key: &str) {
        let mut state = self.lock();
        if let Some(domain) = state.domains.get_mut(key) {
            if domain.blocked_until.take().is_some() {
                info!(partition = key, "Partition unblocked");
            }
            domain.blocked_reason = None;
        }
    }

    pub fn running_count(&self, key: &str) -> usize {
        self.lock()
            .domains
            .get(key)
            .map_or(0, |d| d.running.len())
    }

    /// Evict running sets that saw no completion within the stale threshold
    pub fn sweep_stale(&self) -> Vec<StaleSlot> {
        let now = self.time.now_millis();
        let threshold = self.config.stale_threshold_ms;
        let mut state = self.lock();

        let mut evicted = Vec::new();
        for (key, domain) in state.domains.iter_mut() {
            let Some(oldest_start) = domain.running.values().min().copied() else {
                continue;
            };
            let last_activity = domain.last_completed_at.map_or(oldest_start, |c| c.max(oldest_start));
            if now - last_activity > threshold {
                let mut job_ids: Vec<String> = domain.running.drain().map(|(id, _)| id).collect();
                job_ids.sort();
                warn!(partition = %key, jobs = job_ids.len(), "Evicting stale running slots");
                evicted.push(StaleSlot {
                    partition: key.clone(),
                    job_ids,
                });
            }
        }
        evicted
    }

    /// Sweep every `interval` until shutdown, handing evicted slots to `on_stale`
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        on_stale: StaleCallback,
        mut shutdown: ShutdownToken,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "Governor sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for slot in self.sweep_stale() {
                        (*on_stale)(slot).await;
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("Governor sweeper stopped");
    }
}
