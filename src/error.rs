// Error handling module
// Defines the failure taxonomy shared by the store, transport, manager and resilience layers

use std::time::Duration;
use thiserror::Error;

/// HTTP status the remote service uses to invalidate credentials
pub const UNAUTHORIZED_STATUS: u16 = 401;

/// Reasons a renewal (or a credential lookup) did not produce a usable pair
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No long-lived credential is stored
    #[error("No refresh token available")]
    NoRefreshToken,

    /// A renewal was attempted too soon after the previous one
    #[error("Token renewal rate limited, retry in {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// The remote service rejected the refresh token
    #[error("Refresh token rejected: {message}")]
    Unauthorized { message: String },

    /// No response was received
    #[error("Network failure: {message}")]
    NetworkFailure { message: String },

    /// Non-2xx response other than 401
    #[error("Server error: {status} - {message}")]
    ServerFailure { status: u16, message: String },

    /// The renewal circuit breaker is rejecting calls
    #[error("Circuit breaker is open for '{key}'")]
    CircuitOpen { key: String },
}

impl AuthFailure {
    /// HTTP-like status code for this failure (0 = transport level)
    pub fn status(&self) -> u16 {
        match self {
            AuthFailure::NoRefreshToken => UNAUTHORIZED_STATUS,
            AuthFailure::RateLimited { .. } => 429,
            AuthFailure::Unauthorized { .. } => UNAUTHORIZED_STATUS,
            AuthFailure::NetworkFailure { .. } => 0,
            AuthFailure::ServerFailure { status, .. } => *status,
            AuthFailure::CircuitOpen { .. } => 503,
        }
    }
}

impl From<TransportError> for AuthFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(message) => AuthFailure::NetworkFailure { message },
            TransportError::Status { status, message } if status == UNAUTHORIZED_STATUS => {
                AuthFailure::Unauthorized { message }
            }
            TransportError::Status { status, message } => {
                AuthFailure::ServerFailure { status, message }
            }
            TransportError::Decode { status, message } => {
                AuthFailure::ServerFailure { status, message }
            }
        }
    }
}

/// Errors raised by an HTTP transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, timeout or other failure before a response arrived
    #[error("Request failed: {0}")]
    Network(String),

    /// Response arrived with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// 2xx response whose body was not the expected JSON
    #[error("Invalid response body (HTTP {status}): {message}")]
    Decode { status: u16, message: String },
}

/// Errors raised by a persistence substrate
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors returned by the authenticated API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// No usable access token could be obtained
    #[error("Not authenticated")]
    Unauthenticated,

    /// The remote service rejected the access token; credentials were cleared
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    /// Any other transport or status failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Request was rejected by a circuit breaker
    #[error("Circuit breaker is open for '{0}'")]
    CircuitOpen(String),
}
