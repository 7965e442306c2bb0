//! Retry with exponential backoff for transient cloud errors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;

use crate::cloud::CloudResult;

/// Retries throttling and 5xx failures; everything else fails at once.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    /// Retries performed per operation name.
    retries: Arc<Mutex<HashMap<String, usize>>>,
}

impl RetryPolicy {
    /// Create a policy that makes at most `max_attempts` calls.
    pub fn new(max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            max_delay,
            retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the pause after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full-jitter pause in `[ceiling / 2, ceiling]`.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }

    /// Runs `call` until it succeeds, fails permanently or the attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let pause = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt,
                        self.max_attempts,
                        e,
                        pause
                    );
                    self.record_retry(operation);
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_retry(&self, operation: &str) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        *retries.entry(operation.to_string()).or_insert(0) += 1;
    }

    /// Retry statistics so far.
    pub fn stats(&self) -> RetryStats {
        let retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        RetryStats {
            operations: retries.len(),
            total_retries: retries.values().sum(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Statistics about retried cloud calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    /// Distinct operations that needed at least one retry.
    pub operations: usize,
    /// Total number of retries (excluding first calls).
    pub total_retries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(60));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_secs(4));
        assert_eq!(policy.backoff_ceiling(9), Duration::from_secs(60));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = policy
            .run("describe_instances", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(CloudError::Throttled("Rate exceeded".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            policy.stats(),
            RetryStats {
                operations: 1,
                total_retries: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: CloudResult<()> = policy
            .run("run_instances", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloudError::Unavailable("503".into())) }
            })
            .await;

        assert!(matches!(result, Err(CloudError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: CloudResult<()> = policy
            .run("run_instances", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloudError::InsufficientCapacity("none".into())) }
            })
            .await;

        assert!(matches!(result, Err(CloudError::InsufficientCapacity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
