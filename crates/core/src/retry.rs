//! Retry and polling helpers
//!
//! Two shapes of waiting show up across sail: bounded retries with backoff for
//! flaky network work (cloning, downloading the editor server), and fixed
//! interval polling against a deadline (editor port discovery, waiting for a
//! freshly forked proxy to come online).

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// Random delay between 0 and the computed delay
    #[default]
    FullJitter,
    /// Half the computed delay plus a random half
    EqualJitter,
}

/// Configuration for bounded retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.jittered(self.capped(attempt), &mut fastrand::Rng::new())
    }

    fn capped(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_delay.as_millis()) as u64)
    }

    fn jittered(&self, delay: Duration, rng: &mut fastrand::Rng) -> Duration {
        let ms = delay.as_millis() as u64;
        match self.jitter {
            JitterStrategy::FullJitter => Duration::from_millis(rng.u64(0..=ms)),
            JitterStrategy::EqualJitter => {
                let half = ms / 2;
                Duration::from_millis(half + rng.u64(0..=half))
            }
        }
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Classifier that retries on every error
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation with exponential backoff and jitter
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if classify_error(&error) == RetryDecision::Stop || attempt >= config.max_attempts
                {
                    if attempt >= config.max_attempts {
                        warn!(
                            "All {} attempts exhausted, final error: {:?}",
                            attempt + 1,
                            error
                        );
                    }
                    return Err(error);
                }
                let delay = config.calculate_delay(attempt);
                debug!(
                    "Attempt {} failed ({:?}); sleeping {:?}",
                    attempt, error, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Poll `operation` every `interval` until it succeeds, the classifier says
/// stop, or `timeout` elapses. On deadline the last error is returned.
pub async fn poll_until<T, E, Fut, Op>(
    interval: Duration,
    timeout: Duration,
    mut operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if classify_error(&error) == RetryDecision::Stop
                    || Instant::now() + interval > deadline
                {
                    return Err(error);
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: JitterStrategy::FullJitter,
        };
        assert_eq!(config.capped(0), Duration::from_millis(100));
        assert_eq!(config.capped(2), Duration::from_millis(400));
        assert_eq!(config.capped(10), Duration::from_millis(500));
        assert!(config.calculate_delay(10) <= Duration::from_millis(500));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let config = RetryConfig {
            jitter: JitterStrategy::EqualJitter,
            ..RetryConfig::default()
        };
        let mut rng = fastrand::Rng::with_seed(7);
        let delay = config.jittered(Duration::from_millis(1000), &mut rng);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_eventually_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, String> = retry_async(
            &RetryConfig::default(),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            default_classifier,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_stops_on_terminal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), i32> = retry_async(
            &RetryConfig::default(),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(404)
                }
            },
            |_| RetryDecision::Stop,
        )
        .await;
        assert_eq!(result.unwrap_err(), 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_last_error_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), u32> = poll_until(
            Duration::from_millis(100),
            Duration::from_secs(1),
            || {
                let counter = Arc::clone(&counter);
                async move { Err(counter.fetch_add(1, Ordering::SeqCst)) }
            },
            default_classifier,
        )
        .await;
        let last = result.unwrap_err();
        assert!(last >= 9, "expected about ten polls, got {}", last + 1);
        assert_eq!(last + 1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_midway() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<&str, ()> = poll_until(
            Duration::from_millis(100),
            Duration::from_secs(10),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 3 {
                        Ok("bound")
                    } else {
                        Err(())
                    }
                }
            },
            default_classifier,
        )
        .await;
        assert_eq!(result.unwrap(), "bound");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
