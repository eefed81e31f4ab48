// Per-key circuit breakers
// Closed -> Open after `failure_threshold` consecutive failures, Open -> HalfOpen after
// `reset_timeout`, HalfOpen admits a single trial whose outcome closes or reopens the circuit.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::retry::{with_retry, RetryConfig};
use super::{ResilienceError, Retryable};

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial call
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
    /// Calls rejected without running the operation
    pub rejected_count: u64,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    rejected_count: u64,
    trial_in_flight: bool,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            rejected_count: 0,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            opened_at: self.opened_at,
            rejected_count: self.rejected_count,
        }
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Releases a half-open trial slot if the trial never reported an outcome
struct TrialGuard<'a> {
    breakers: &'a CircuitBreakers,
    key: &'a str,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.admission == Admission::Trial && !self.settled {
            if let Some(mut record) = self.breakers.records.get_mut(self.key) {
                record.trial_in_flight = false;
            }
        }
    }
}

/// Registry of breakers keyed by operation name
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    records: DashMap<String, BreakerRecord>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` behind the breaker for `key`
    pub async fn with_circuit_breaker<T, E, F, Fut>(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard(key, config, async move {
            operation()
                .await
                .map_err(|error| ResilienceError::Exhausted { error, retries: 0 })
        })
        .await
    }

    /// Breaker around a retried operation; exhausting the retries is a single strike
    pub async fn with_retry_and_circuit_breaker<T, E, F, Fut>(
        &self,
        key: &str,
        retry: &RetryConfig,
        breaker: &CircuitBreakerConfig,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard(key, breaker, with_retry(operation, retry)).await
    }

    async fn guard<T, E, Fut>(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
        call: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let admission = match self.admit(key, config) {
            Some(admission) => admission,
            None => {
                tracing::debug!(key = key, "Circuit breaker rejected call");
                return Err(ResilienceError::CircuitOpen {
                    key: key.to_string(),
                });
            }
        };

        let mut trial = TrialGuard {
            breakers: self,
            key,
            admission,
            settled: false,
        };

        let result = call.await;
        self.record(key, config, admission, result.is_ok());
        trial.settled = true;

        result
    }

    fn admit(&self, key: &str, config: &CircuitBreakerConfig) -> Option<Admission> {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let elapsed = record
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(Duration::MAX);
                if elapsed >= config.reset_timeout {
                    tracing::info!(key = key, "Circuit breaker half-open, admitting trial call");
                    record.state = CircuitState::HalfOpen;
                    record.trial_in_flight = true;
                    Some(Admission::Trial)
                } else {
                    record.rejected_count += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if record.trial_in_flight {
                    record.rejected_count += 1;
                    None
                } else {
                    record.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
        admission: Admission,
        success: bool,
    ) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(BreakerRecord::new);

        match (record.state, success) {
            // Only the trial decides the half-open outcome
            (CircuitState::HalfOpen, _) if admission == Admission::Normal => {}
            (CircuitState::HalfOpen, true) => {
                tracing::info!(key = key, "Circuit breaker closed after successful trial");
                record.close();
                record.success_count = 1;
            }
            (CircuitState::HalfOpen, false) => {
                tracing::warn!(key = key, "Trial call failed, circuit breaker reopened");
                record.open(now);
            }
            (CircuitState::Closed, true) => {
                record.failure_count = 0;
                record.success_count += 1;
            }
            (CircuitState::Closed, false) => {
                record.failure_count += 1;
                if record.failure_count >= config.failure_threshold {
                    tracing::warn!(
                        key = key,
                        failures = record.failure_count,
                        "Circuit breaker opened"
                    );
                    record.open(now);
                }
            }
            // Opened by a concurrent call; late outcomes are ignored
            (CircuitState::Open, _) => {}
        }
    }

    /// Snapshot of the breaker for `key`, if it has been used
    pub fn get_stats(&self, key: &str) -> Option<BreakerStats> {
        self.records.get(key).map(|record| record.stats())
    }

    /// Forget the breaker for `key`
    pub fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    pub fn reset_all(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    const KEY: &str = "renewal";

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }

    fn failure() -> AuthFailure {
        AuthFailure::ServerFailure {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    async fn fail(
        breakers: &CircuitBreakers,
        calls: &AtomicU32,
    ) -> Result<(), ResilienceError<AuthFailure>> {
        breakers
            .with_circuit_breaker(KEY, &config(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            })
            .await
    }

    async fn succeed(
        breakers: &CircuitBreakers,
        calls: &AtomicU32,
    ) -> Result<(), ResilienceError<AuthFailure>> {
        breakers
            .with_circuit_breaker(KEY, &config(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(
                fail(&breakers, &calls).await,
                Err(ResilienceError::Exhausted { .. })
            ));
        }
        assert_eq!(breakers.get_stats(KEY).unwrap().state, CircuitState::Open);

        let result = succeed(&breakers, &calls).await;
        assert_eq!(
            result,
            Err(ResilienceError::CircuitOpen {
                key: KEY.to_string()
            })
        );
        assert!(result.unwrap_err().to_string().contains("circuit breaker is open"));
        // The rejected call never ran
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breakers.get_stats(KEY).unwrap().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);

        let _ = fail(&breakers, &calls).await;
        let _ = fail(&breakers, &calls).await;
        succeed(&breakers, &calls).await.unwrap();
        let _ = fail(&breakers, &calls).await;

        let stats = breakers.get_stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breakers, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&breakers, &calls).await.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&breakers, &calls).await.unwrap();

        let stats = breakers.get_stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.opened_at, None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breakers, &calls).await;
        }
        let first_opened = breakers.get_stats(KEY).unwrap().opened_at.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(
            fail(&breakers, &calls).await,
            Err(ResilienceError::Exhausted { .. })
        ));

        let stats = breakers.get_stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.opened_at.unwrap() > first_opened);

        // Fresh timeout: still rejecting right after reopening
        assert!(matches!(
            succeed(&breakers, &calls).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breakers, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let cfg = config();
        let slow_trial = breakers.with_circuit_breaker(KEY, &cfg, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, AuthFailure>(())
        });
        let concurrent = async {
            tokio::task::yield_now().await;
            succeed(&breakers, &calls).await
        };

        let (trial, second) = tokio::join!(slow_trial, concurrent);
        assert!(trial.is_ok());
        assert!(matches!(second, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(breakers.get_stats(KEY).unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breakers, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let cfg = config();
        let abandoned = breakers.with_circuit_breaker(KEY, &cfg, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, AuthFailure>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), abandoned).await;
        assert!(timed_out.is_err());
        assert_eq!(breakers.get_stats(KEY).unwrap().state, CircuitState::HalfOpen);

        succeed(&breakers, &calls).await.unwrap();
        assert_eq!(breakers.get_stats(KEY).unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_as_one_strike() {
        let breakers = CircuitBreakers::new();
        let calls = &AtomicU32::new(0);
        let retry = RetryConfig::quick().without_jitter();

        let result: Result<(), _> = breakers
            .with_retry_and_circuit_breaker(KEY, &retry, &config(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { retries: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = breakers.get_stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_reset_all() {
        let breakers = CircuitBreakers::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breakers, &calls).await;
        }
        breakers
            .with_circuit_breaker("other", &config(), || async { Ok::<_, AuthFailure>(()) })
            .await
            .unwrap();

        breakers.reset(KEY);
        assert!(breakers.get_stats(KEY).is_none());
        succeed(&breakers, &calls).await.unwrap();
        assert!(breakers.get_stats("other").is_some());

        breakers.reset_all();
        assert!(breakers.get_stats(KEY).is_none());
        assert!(breakers.get_stats("other").is_none());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
