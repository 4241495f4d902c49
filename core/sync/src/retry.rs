//! Retry strategy with linear or exponential backoff for transient errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use showsync_common::{Error, Result};

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base × attempt`
    Linear,
    /// `base × 2^(attempt-1)`
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit the backoff curve is built from.
    pub base_delay: Duration,
    /// Delay curve.
    pub backoff: Backoff,
    /// Cap on a single delay.
    pub max_delay: Duration,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
    /// Deadline for a single attempt. Exceeding it is a retryable timeout.
    pub call_timeout: Option<Duration>,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            backoff: Backoff::Exponential,
            max_delay: Duration::from_secs(30),
            jitter: false,
            call_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay curve.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set or clear the per-attempt deadline.
    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_millis() as f64;
        let raw = match self.backoff {
            Backoff::Linear => base * attempt as f64,
            Backoff::Exponential => base * 2f64.powi(attempt as i32 - 1),
        };

        let capped = raw.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped * jitter_factor
        } else {
            capped
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Retry executor for running operations with retry logic.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying transient errors.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, Error::is_transient, |_, _| {}).await
    }

    /// Execute with a custom retry condition and a hook run before every wait.
    ///
    /// `on_retry` receives the number of the attempt that just failed and
    /// its error. The final error is returned once `max_attempts` attempts
    /// have failed; an error rejected by `is_retryable` is returned at once.
    pub async fn execute_with<F, Fut, T, C, H>(
        &self,
        operation: F,
        is_retryable: C,
        on_retry: H,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
        H: Fn(u32, &Error),
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.run_attempt(&operation).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(err);
                    }

                    if attempt >= self.config.max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    on_retry(attempt, &err);
                    sleep(delay).await;
                }
            }
        }
    }

    async fn run_attempt<F, Fut, T>(&self, operation: &F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.config.call_timeout {
            Some(limit) => match timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("call exceeded {:?}", limit))),
            },
            None => operation().await,
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Convenience function for simple retry with defaults.
pub async fn retry<F, Fut, T>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::default().execute(operation).await
}

/// Convenience function for retry with custom config.
pub async fn retry_with_config<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(config).execute(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts).with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let config = RetryConfig::new(3).with_base_delay(Duration::from_secs(1));

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_linear_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_base_delay(Duration::from_millis(500))
            .with_backoff(Backoff::Linear);

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(1500));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        // 1 * 2^9 = 512 seconds, but should be capped at 10
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(3)
            .with_base_delay(Duration::from_millis(1000))
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::default();
        let result: Result<i32> = executor.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_on_network_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(fast(3));

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::Network("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(fast(3));

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("Show not found".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exactly_max_attempts() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(fast(3));

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Unavailable("Always fails".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Unavailable(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_on_retry_called_before_each_wait() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = seen.clone();
        let executor = RetryExecutor::new(fast(4));

        let result: Result<()> = executor
            .execute_with(
                || async { Err(Error::RateLimited("slow down".to_string())) },
                Error::is_transient,
                move |attempt, _err| seen_hook.lock().unwrap().push(attempt),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_custom_condition_stops_retries() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(fast(5));

        let result: Result<()> = executor
            .execute_with(
                move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Network("down".to_string()))
                    }
                },
                |_| false,
                |_, _| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(
            fast(2).with_call_timeout(Some(Duration::from_millis(10))),
        );

        let result: Result<()> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_convenience_retry_function() {
        let result: Result<String> = retry(|| async { Ok("success".to_string()) }).await;
        assert_eq!(result.unwrap(), "success");

        let result: Result<u8> = retry_with_config(fast(1), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
