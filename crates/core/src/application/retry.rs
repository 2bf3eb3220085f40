// Retry logic
use crate::domain::Job;
use tracing::{info, warn};

/// Default retry base delay (1s)
pub const DEFAULT_RETRY_BASE_DELAY_MS: i64 = 1000;

/// Default backoff cap (1h)
pub const DEFAULT_RETRY_MAX_DELAY_MS: i64 = 60 * 60 * 1000;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry as attempt `retry_count` after `delay_ms`
    Retry { retry_count: i32, delay_ms: i64 },
    /// No attempts left, job fails terminally
    Exhausted,
}

/// Exponential backoff with deterministic per-job jitter
///
/// delay = base_delay * factor^retry_count * (0.9..=1.1), capped at max_delay
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay_ms: i64,
    max_delay_ms: i64,
    backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE_DELAY_MS)
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `base_delay_ms` - Delay before the first retry
    ///
    /// # Example
    /// ```text
    /// let policy = RetryPolicy::new(1000).with_max_delay(60_000);
    /// ```
    pub fn new(base_delay_ms: i64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_factor: 2.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: i64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Backoff before retry number `retry_count + 1`
    pub fn backoff_ms(&self, job_id: &str, retry_count: i32) -> i64 {
        let exponential = self.base_delay_ms as f64 * self.backoff_factor.powi(retry_count.max(0));

        // ±10% jitter against thundering herds, seeded by the job id
        // so the same job always gets the same schedule
        let jitter_seed = job_id.chars().map(|c| c as u32).fold(0u32, u32::wrapping_add);
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0);

        let delay = (exponential * jitter_factor) as i64;
        delay.clamp(0, self.max_delay_ms)
    }

    /// Decide what happens after a failed attempt of `job`
    pub fn decide(&self, job: &Job) -> RetryDecision {
        if job.retry_count >= job.max_retries {
            warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Max retries reached"
            );
            return RetryDecision::Exhausted;
        }

        let delay_ms = self.backoff_ms(&job.id, job.retry_count);
        info!(
            job_id = %job.id,
            retry_count = job.retry_count + 1,
            max_retries = job.max_retries,
            delay_ms,
            "Scheduling retry"
        );

        RetryDecision::Retry {
            retry_count: job.retry_count + 1,
            delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(1000);
        let first = policy.backoff_ms("job-a", 0);
        let third = policy.backoff_ms("job-a", 2);

        assert!((900..=1100).contains(&first), "first backoff was {}", first);
        assert!((3600..=4400).contains(&third), "third backoff was {}", third);
    }

    #[test]
    fn test_jitter_is_deterministic_per_job() {
        let policy = RetryPolicy::new(1000);
        assert_eq!(policy.backoff_ms("job-x", 1), policy.backoff_ms("job-x", 1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(1000).with_max_delay(5000);
        assert_eq!(policy.backoff_ms("job-a", 20), 5000);
    }

    #[test]
    fn test_decide_until_exhausted() {
        let policy = RetryPolicy::default();
        let mut job = Job::new_test("q", "k");
        job.max_retries = 3;

        for expected in 1..=3 {
            match policy.decide(&job) {
                RetryDecision::Retry { retry_count, .. } => {
                    assert_eq!(retry_count, expected);
                    job.retry_count = retry_count;
                }
                RetryDecision::Exhausted => panic!("exhausted too early at {}", expected),
            }
        }
        assert_eq!(policy.decide(&job), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_retry_budget() {
        let mut job = Job::new_test("q", "k");
        job.max_retries = 0;
        assert_eq!(RetryPolicy::default().decide(&job), RetryDecision::Exhausted);
    }
}
