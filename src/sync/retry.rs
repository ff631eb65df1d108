//! Retry manager for handling transient failures with exponential backoff
//!
//! Used at single-item granularity: a failed catalog page or detail fetch is
//! retried here, and only the final error reaches the orchestrator.

use crate::clock::{Clock, SystemClock};
use crate::config::RetryConfig;
use crate::error::RetryableError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry manager with exponential backoff support
#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .finish()
    }
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a RetryManager that waits on the given clock
    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Create a RetryManager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Execute an async operation with retry logic
    ///
    /// The operation is retried up to `max_retries` times while it returns a
    /// retryable error, waiting an exponentially increasing backoff between
    /// attempts. The last error is returned once retries are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        if err.is_retryable() {
                            warn!(
                                attempts = attempt + 1,
                                max_retries = self.config.max_retries,
                                error = %err,
                                "Max retries exhausted"
                            );
                        }
                        return Err(err);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );

                    if !backoff.is_zero() {
                        self.clock.sleep_until(self.clock.now() + backoff).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// `initial_backoff * multiplier^attempt`, capped at `max_backoff_ms`.
    /// With jitter enabled the result is scaled into 50-100% of that value.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);

        let delay = if self.config.jitter {
            let jitter = rand::thread_rng().gen_range(0.5..1.0);
            capped * jitter
        } else {
            capped
        };

        Duration::from_secs_f64(delay / 1000.0)
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_wait(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    // Test 1: Success on first attempt returns immediately
    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let manager = RetryManager::new(no_wait(3));

        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let result: Result<&str, SyncError> = manager
            .execute(|| {
                let count = call_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok("success")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    // Test 2: Retries on transient error and eventually succeeds
    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let manager = RetryManager::new(no_wait(3));

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<&str, SyncError> = manager
            .execute(|| {
                let count = attempt_count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(SyncError::NetworkTimeout)
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    // Test 3: Gives up after max retries
    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let manager = RetryManager::new(no_wait(2));

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<(), SyncError> = manager
            .execute(|| {
                let count = attempt_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::ServerError(503))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), SyncError::ServerError(503));
        // Initial attempt + max_retries
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    // Test 4: Permanent and auth errors return immediately
    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let manager = RetryManager::new(no_wait(5));

        for err in [
            SyncError::NotFound,
            SyncError::Unauthorized,
            SyncError::Empty("no detail".to_string()),
        ] {
            let attempt_count = Arc::new(AtomicU32::new(0));
            let attempt_count_clone = attempt_count.clone();
            let expected = err.clone();

            let result: Result<(), SyncError> = manager
                .execute(|| {
                    let count = attempt_count_clone.clone();
                    let err = err.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(err)
                    }
                })
                .await;

            assert_eq!(result.unwrap_err(), expected);
            assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
        }
    }

    // Test 5: Exponential backoff calculation without jitter
    #[test]
    fn test_exponential_backoff_calculation() {
        let manager = RetryManager::new(RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(manager.calculate_backoff(0), Duration::from_millis(500));
        assert_eq!(manager.calculate_backoff(1), Duration::from_millis(1000));
        assert_eq!(manager.calculate_backoff(2), Duration::from_millis(2000));
        assert_eq!(manager.calculate_backoff(3), Duration::from_millis(4000));
    }

    // Test 6: Backoff strictly increases until the cap, then stays there
    #[test]
    fn test_backoff_monotonic_and_capped() {
        let manager = RetryManager::new(RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
        });

        let delays: Vec<_> = (0..10).map(|a| manager.calculate_backoff(a)).collect();
        let uncapped: Vec<_> = delays
            .iter()
            .take_while(|d| **d < Duration::from_secs(10))
            .collect();
        assert!(uncapped.windows(2).all(|w| w[0] < w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(delays[9], Duration::from_secs(10));
    }

    // Test 7: Jitter keeps backoff in the 50-100% range
    #[test]
    fn test_jitter_within_range() {
        let manager = RetryManager::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter: true,
        });

        for _ in 0..100 {
            let backoff = manager.calculate_backoff(0);
            assert!(
                backoff >= Duration::from_secs(5) && backoff <= Duration::from_secs(10),
                "Backoff {:?} should be between 5-10 seconds",
                backoff
            );
        }
    }

    // Test 8: Rate limited error is retried
    #[tokio::test]
    async fn test_rate_limited_error_is_retried() {
        let manager = RetryManager::new(no_wait(2));

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<&str, SyncError> = manager
            .execute(|| {
                let count = attempt_count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 1 {
                        Err(SyncError::RateLimited(60))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    // Test 9: Waits happen on the injected clock
    #[tokio::test]
    async fn test_backoff_waits_on_clock() {
        let clock = Arc::new(ManualClock::new());
        let manager = RetryManager::with_clock(
            RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 100,
                max_backoff_ms: 10_000,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            clock.clone(),
        );

        let result: Result<(), SyncError> = manager
            .execute(|| async { Err(SyncError::ConnectionRefused) })
            .await;

        assert!(result.is_err());
        // 100 + 200 + 400
        assert_eq!(clock.elapsed(), Duration::from_millis(700));
    }

    // Test 10: Default configuration
    #[test]
    fn test_default_configuration() {
        let manager = RetryManager::with_defaults();
        let config = manager.config();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff_ms, 1000);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter);
    }

    // Test 11: Zero max_retries still allows initial attempt
    #[tokio::test]
    async fn test_zero_max_retries() {
        let manager = RetryManager::new(no_wait(0));

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<(), SyncError> = manager
            .execute(|| {
                let count = attempt_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::NetworkTimeout)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }
}
