use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::CredentialManager;
use crate::error::{ApiError, TransportError, UNAUTHORIZED_STATUS};
use crate::resilience::{with_retry, CircuitBreakerConfig, ResilienceError, RetryConfig};

/// Breaker key shared by all authenticated API calls
pub const API_BREAKER_KEY: &str = "api";

/// A JSON request against the remote service
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

/// Generic request function used for renewal and authenticated calls
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request; 2xx bodies are parsed as JSON (empty body = `null`)
    async fn send(&self, request: TransportRequest) -> Result<Value, TransportError>;
}

/// reqwest-backed transport with connection pooling
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Base URL every request path is appended to
    base_url: String,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(base_url: &str, connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<Value, TransportError> {
        let url = self.url(&request.path);
        let method = request.method.clone();

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let mut builder = self.client.request(request.method, &url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                // Categorize the error for better debugging
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                return Err(TransportError::Network(format!("{} (kind: {})", e, error_kind)));
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                url = %url,
                response_body = %text,
                "Received error response"
            );
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: error_message(&text, status.as_u16()),
            });
        }

        tracing::debug!(status = %status, "Request successful");

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| TransportError::Decode {
            status: status.as_u16(),
            message: e.to_string(),
        })
    }
}

/// Extract a human-readable message from a failure body (plain text or JSON)
fn error_message(body: &str, status: u16) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        for field in ["message", "error_description", "detail", "error"] {
            if let Some(message) = json.get(field).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.to_string()
    }
}

/// Authenticated JSON client
/// Attaches the current access token and routes 401 responses to the credential manager
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialManager,
    retry: RetryConfig,
    breaker: Option<CircuitBreakerConfig>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialManager,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            retry,
            breaker: None,
        }
    }

    /// Guard calls with a breaker from the credential manager's registry
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Execute an authenticated request with retry on transient failures
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let token = self
            .credentials
            .get_valid_access_token()
            .await
            .ok_or(ApiError::Unauthenticated)?;

        let mut request = TransportRequest::new(method, path).bearer(token);
        request.body = body;

        let send = || self.transport.send(request.clone());
        let result = match &self.breaker {
            None => with_retry(send, &self.retry).await,
            Some(breaker) => {
                self.credentials
                    .breakers()
                    .with_retry_and_circuit_breaker(API_BREAKER_KEY, &self.retry, breaker, send)
                    .await
            }
        };

        match result {
            Ok(value) => Ok(value),
            Err(ResilienceError::Exhausted {
                error: TransportError::Status { status, message },
                ..
            }) if status == UNAUTHORIZED_STATUS => {
                self.credentials.handle_remote_auth_failure(status, &message);
                Err(ApiError::Unauthorized(message))
            }
            Err(ResilienceError::Exhausted { error, .. }) => Err(ApiError::Transport(error)),
            Err(ResilienceError::CircuitOpen { key }) => Err(ApiError::CircuitOpen(key)),
        }
    }
}
