// Retry with exponential backoff

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{ResilienceError, Retryable};

/// Decides whether a failure should be retried, given the zero-based attempt index
pub type ShouldRetry = Arc<dyn Fn(&dyn Retryable, u32) -> bool + Send + Sync>;

/// Invoked before each retry with the failure and the one-based retry number
pub type OnRetry = Arc<dyn Fn(&dyn Retryable, u32) + Send + Sync>;

/// Backoff policy for [`with_retry`]
#[derive(Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 10% random delay to avoid synchronized retries
    pub jitter: bool,
    pub should_retry: Option<ShouldRetry>,
    pub on_retry: Option<OnRetry>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryConfig {
    /// Few fast retries for interactive calls
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: true,
            should_retry: None,
            on_retry: None,
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Many retries for background work that must eventually succeed
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Slow retries that never repeat an authentication failure
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 3.0,
            jitter: true,
            should_retry: Some(Arc::new(|error: &dyn Retryable, _attempt: u32| {
                !error.is_auth_failure() && error.is_retryable()
            })),
            on_retry: None,
        }
    }

    /// Disable retries entirely
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    pub fn with_should_retry<F>(mut self, should_retry: F) -> Self
    where
        F: Fn(&dyn Retryable, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(should_retry));
        self
    }

    pub fn with_on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(&dyn Retryable, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry following `attempt` (zero-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = delay.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>();
        delay + Duration::from_millis(jitter as u64)
    }

    fn permits_retry<E: Retryable>(&self, error: &E, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        match &self.should_retry {
            Some(should_retry) => should_retry(error as &dyn Retryable, attempt),
            None => error.is_retryable(),
        }
    }
}

/// Run `operation` until it succeeds or the policy gives up
///
/// Only `Err` results are retried. A panic inside the operation is a bug, not a
/// transient failure, and propagates without retry.
pub async fn with_retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
) -> Result<T, ResilienceError<E>>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(retries = attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                if !config.permits_retry(&error, attempt) {
                    tracing::debug!(
                        retries = attempt,
                        error = %error,
                        "Operation failed, not retrying"
                    );
                    return Err(ResilienceError::Exhausted {
                        error,
                        retries: attempt,
                    });
                }

                let delay = config.delay_with_jitter(attempt);
                tracing::warn!(
                    "Operation failed: {}, retrying after {}ms (attempt {}/{})",
                    error,
                    delay.as_millis(),
                    attempt + 1,
                    config.max_retries
                );

                if let Some(on_retry) = &config.on_retry {
                    on_retry(&error as &dyn Retryable, attempt + 1);
                }

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn network_failure() -> AuthFailure {
        AuthFailure::NetworkFailure {
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::standard();

        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        // Capped at max_delay
        assert_eq!(config.backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = RetryConfig::standard();
        for attempt in 0..3 {
            let base = config.backoff_delay(attempt);
            let delay = config.delay_with_jitter(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }

    #[test]
    fn test_presets_differ() {
        let quick = RetryConfig::quick();
        let aggressive = RetryConfig::aggressive();
        let conservative = RetryConfig::conservative();

        assert!(quick.max_retries < aggressive.max_retries);
        assert!(quick.initial_delay < conservative.initial_delay);
        assert!(conservative.should_retry.is_some());
        assert!(RetryConfig::standard().should_retry.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_invocation() {
        let calls = &AtomicU32::new(0);

        let result = with_retry(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(network_failure())
                } else {
                    Ok(n)
                }
            },
            &RetryConfig::standard(),
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(network_failure())
            },
            &RetryConfig::quick(),
        )
        .await;

        assert_eq!(
            result,
            Err(ResilienceError::Exhausted {
                error: network_failure(),
                retries: 2,
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_errors_fail_fast() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthFailure::Unauthorized {
                    message: "revoked".to_string(),
                })
            },
            &RetryConfig::aggressive(),
        )
        .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { retries: 0, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conservative_never_retries_auth_failures() {
        let config = RetryConfig::conservative();
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthFailure::Unauthorized {
                    message: "expired".to_string(),
                })
            },
            &config,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_should_retry_and_on_retry() {
        let retried = Arc::new(AtomicU32::new(0));
        let observed = retried.clone();
        let config = RetryConfig::quick()
            .with_should_retry(|_error, attempt| attempt < 1)
            .with_on_retry(move |_error, retry| {
                observed.store(retry, Ordering::SeqCst);
            });

        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthFailure::ServerFailure {
                    status: 400,
                    message: "bad request".to_string(),
                })
            },
            &config,
        )
        .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { retries: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retried.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let config = RetryConfig::quick().without_jitter();
        let started = tokio::time::Instant::now();

        let _: Result<(), _> = with_retry(|| async { Err(network_failure()) }, &config).await;

        // 100ms + 200ms
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
