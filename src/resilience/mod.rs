// Resilience module
// Retry with backoff and per-key circuit breakers for fallible async calls

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{BreakerStats, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use retry::{with_retry, OnRetry, RetryConfig, ShouldRetry};

use std::fmt;
use thiserror::Error;

use crate::error::{AuthFailure, TransportError, UNAUTHORIZED_STATUS};

/// Classification used by the default retry policy
pub trait Retryable: fmt::Display {
    /// Transient failure worth repeating
    fn is_retryable(&self) -> bool;

    /// The failure means the caller's credentials were rejected
    fn is_auth_failure(&self) -> bool {
        false
    }
}

/// Failure of a guarded operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    /// The operation failed and the retry policy gave up
    #[error("{error} (after {retries} retries)")]
    Exhausted { error: E, retries: u32 },

    /// The breaker rejected the call without running it
    #[error("circuit breaker is open for '{key}'")]
    CircuitOpen { key: String },
}

impl<E> ResilienceError<E> {
    /// The operation's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Exhausted { error, .. } => Some(error),
            ResilienceError::CircuitOpen { .. } => None,
        }
    }
}

/// Whether a status code is worth retrying (429 and 5xx)
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

impl Retryable for AuthFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AuthFailure::NetworkFailure { .. } => true,
            AuthFailure::ServerFailure { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AuthFailure::Unauthorized { .. } | AuthFailure::NoRefreshToken
        )
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => is_retryable_status(*status),
            TransportError::Decode { .. } => false,
        }
    }

    fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Status { status, .. } if *status == UNAUTHORIZED_STATUS)
    }
}
