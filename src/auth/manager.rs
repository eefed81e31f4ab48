use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::codec;
use super::store::CredentialStore;
use super::types::{AuthEvent, AuthStatus, CredentialPair, RenewResponse};
use crate::error::{AuthFailure, UNAUTHORIZED_STATUS};
use crate::http_client::{HttpTransport, TransportRequest};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakers, ResilienceError, RetryConfig};

/// Default path of the renewal endpoint
pub const DEFAULT_RENEW_PATH: &str = "/api/auth/refresh";

/// Breaker key used for renewal calls
pub const RENEWAL_BREAKER_KEY: &str = "auth.renew";

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Outcome of a renewal, shared by every caller that joined it
pub type RenewalOutcome = Result<CredentialPair, AuthFailure>;

type SharedRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

/// Retry and circuit breaker policy wrapped around the renewal call
#[derive(Debug, Clone, Default)]
pub struct RenewalResilience {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
}

/// Manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path of the renewal endpoint on the remote service
    pub renew_path: String,

    /// Minimum time between two renewal attempts
    pub min_renew_interval: Duration,

    /// Optional retry/breaker policy for the renewal call
    pub resilience: Option<RenewalResilience>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            renew_path: DEFAULT_RENEW_PATH.to_string(),
            min_renew_interval: Duration::from_secs(5),
            resilience: None,
        }
    }
}

struct InFlight {
    ticket: u64,
    outcome: SharedRenewal,
}

#[derive(Default)]
struct RenewalState {
    in_flight: Option<InFlight>,

    /// `None` means no attempt yet, so the first renewal is never rate limited
    last_attempt: Option<Instant>,

    /// Bumped whenever credentials are invalidated; renewals started in an
    /// older epoch must not persist their result
    epoch: u64,

    next_ticket: u64,
}

struct Inner {
    store: CredentialStore,
    transport: Arc<dyn HttpTransport>,
    config: ManagerConfig,
    breakers: Arc<CircuitBreakers>,
    events: broadcast::Sender<AuthEvent>,
    state: Mutex<RenewalState>,
}

/// Credential lifecycle manager
/// Renews the access token on demand with de-duplication and rate limiting.
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    pub fn new(
        store: CredentialStore,
        transport: Arc<dyn HttpTransport>,
        config: ManagerConfig,
    ) -> Self {
        Self::with_breakers(store, transport, config, Arc::new(CircuitBreakers::new()))
    }

    /// Share a breaker registry with other parts of the application
    pub fn with_breakers(
        store: CredentialStore,
        transport: Arc<dyn HttpTransport>,
        config: ManagerConfig,
        breakers: Arc<CircuitBreakers>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                config,
                breakers,
                events,
                state: Mutex::new(RenewalState::default()),
            }),
        }
    }

    /// Receive `TokenRefresh` and `Logout` notifications
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.inner.breakers
    }

    /// Persist a freshly issued pair (e.g. after login)
    pub fn set_credentials(&self, pair: &CredentialPair) -> bool {
        self.inner.store.set(pair)
    }

    /// Get a usable access token, renewing it if it has expired
    /// All failures collapse to `None`; call [`renew`](Self::renew) for details.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        if let Some(token) = self.inner.store.get_access_token() {
            if !codec::is_expired(&token) {
                return Some(token);
            }
            tracing::debug!("Access token expired, renewal required");
        }

        if self.inner.store.get_refresh_token().is_none() {
            tracing::debug!("No refresh token stored, cannot renew");
            return None;
        }

        match self.renew().await {
            Ok(pair) => Some(pair.access_token),
            Err(AuthFailure::RateLimited { .. }) => {
                // Another renewal may have settled since the first read
                let token = self.inner.store.get_access_token()?;
                if codec::is_expired(&token) {
                    tracing::warn!("Access token expired and renewal is rate limited");
                    return None;
                }
                Some(token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not obtain a valid access token");
                None
            }
        }
    }

    /// Exchange the refresh token for a new pair
    ///
    /// Concurrent callers share one in-flight renewal and observe the same
    /// outcome. A new attempt within `min_renew_interval` of the previous one
    /// fails with [`AuthFailure::RateLimited`] without touching the network.
    pub async fn renew(&self) -> RenewalOutcome {
        let pending = {
            let mut state = self.inner.state.lock();

            let joined = state.in_flight.as_ref().map(|f| f.outcome.clone());
            if let Some(outcome) = joined {
                tracing::debug!("Renewal already in progress, joining it");
                outcome
            } else {
                if let Some(last) = state.last_attempt {
                    let elapsed = last.elapsed();
                    let min_interval = self.inner.config.min_renew_interval;
                    if elapsed < min_interval {
                        let retry_after = min_interval - elapsed;
                        tracing::warn!(
                            retry_after_ms = retry_after.as_millis() as u64,
                            "Token renewal rate limited"
                        );
                        return Err(AuthFailure::RateLimited { retry_after });
                    }
                }

                let Some(refresh_token) = self.inner.store.get_refresh_token() else {
                    tracing::debug!("Renewal requested without a refresh token");
                    return Err(AuthFailure::NoRefreshToken);
                };

                state.last_attempt = Some(Instant::now());
                state.next_ticket += 1;
                let ticket = state.next_ticket;
                let epoch = state.epoch;

                // Runs in its own task so it completes even if every caller goes away
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let _settled = InFlightGuard {
                        inner: &inner,
                        ticket,
                    };
                    inner.run_renewal(&refresh_token, epoch).await
                });

                let outcome = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(AuthFailure::NetworkFailure {
                            message: format!("Renewal task failed: {}", e),
                        })
                    })
                }
                .boxed()
                .shared();

                state.in_flight = Some(InFlight {
                    ticket,
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        pending.await
    }

    /// Wipe stored credentials and reset renewal state (explicit logout)
    pub fn clear(&self) {
        tracing::info!("Clearing credentials");
        self.inner.reset_session();
    }

    /// Both tokens are stored
    pub fn has_credentials(&self) -> bool {
        self.inner.store.has()
    }

    pub fn get_status(&self) -> AuthStatus {
        let renewal_in_progress = self.inner.state.lock().in_flight.is_some();

        AuthStatus {
            has_access_token: self.inner.store.get_access_token().is_some(),
            has_refresh_token: self.inner.store.get_refresh_token().is_some(),
            renewal_in_progress,
        }
    }

    /// Route a rejected request from any HTTP caller
    /// Returns `true` when the status was an authoritative rejection and credentials were cleared.
    pub fn handle_remote_auth_failure(&self, status: u16, message: &str) -> bool {
        if status != UNAUTHORIZED_STATUS {
            return false;
        }

        tracing::warn!(status = status, message = message, "Access token rejected, logging out");
        self.inner.reset_session();
        self.inner.emit(AuthEvent::Logout);
        true
    }
}

/// Clears the in-flight marker when the renewal task ends, even on panic
struct InFlightGuard<'a> {
    inner: &'a Inner,
    ticket: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.in_flight.as_ref().map(|f| f.ticket) == Some(self.ticket) {
            state.in_flight = None;
        }
    }
}

impl Inner {
    async fn run_renewal(&self, refresh_token: &str, epoch: u64) -> RenewalOutcome {
        tracing::info!("Renewing access token...");
        let result = self.request_renewal(refresh_token).await;
        self.settle(result, epoch)
    }

    async fn request_renewal(&self, refresh_token: &str) -> RenewalOutcome {
        let request = TransportRequest::new(Method::POST, self.config.renew_path.as_str())
            .json(json!({ "refresh_token": refresh_token }));

        let this: &Inner = self;
        let attempt = move || {
            let request = request.clone();
            async move {
                let value = this
                    .transport
                    .send(request)
                    .await
                    .map_err(AuthFailure::from)?;
                parse_renewal_response(value)
            }
        };

        match &self.config.resilience {
            None => attempt().await,
            Some(policy) => self
                .breakers
                .with_retry_and_circuit_breaker(
                    RENEWAL_BREAKER_KEY,
                    &policy.retry,
                    &policy.breaker,
                    attempt,
                )
                .await
                .map_err(|e| match e {
                    ResilienceError::Exhausted { error, .. } => error,
                    ResilienceError::CircuitOpen { key } => AuthFailure::CircuitOpen { key },
                }),
        }
    }

    fn settle(&self, result: RenewalOutcome, epoch: u64) -> RenewalOutcome {
        match result {
            Ok(pair) => {
                {
                    let state = self.state.lock();
                    if state.epoch != epoch {
                        tracing::info!("Credentials were cleared during renewal, discarding new pair");
                        return Err(AuthFailure::NoRefreshToken);
                    }
                    if !self.store.set(&pair) {
                        tracing::error!("Renewed credentials could not be persisted");
                    }
                }

                tracing::info!(
                    "Access token renewed (token: {}...)",
                    pair.access_token.get(..12).unwrap_or_default()
                );
                self.emit(AuthEvent::TokenRefresh(pair.clone()));
                Ok(pair)
            }
            Err(AuthFailure::Unauthorized { message }) => {
                let current = {
                    let mut state = self.state.lock();
                    if state.epoch == epoch {
                        state.epoch += 1;
                        self.store.clear();
                        true
                    } else {
                        false
                    }
                };

                tracing::error!(message = %message, "Refresh token rejected, logging out");
                if current {
                    self.emit(AuthEvent::Logout);
                }
                Err(AuthFailure::Unauthorized { message })
            }
            Err(e) => {
                tracing::error!(status = e.status(), error = %e, "Token renewal failed");
                Err(e)
            }
        }
    }

    /// Invalidate the session. A renewal still in flight keeps its slot until it
    /// settles (its result is discarded by the epoch check), so a new renewal
    /// never overlaps it on the network.
    fn reset_session(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.last_attempt = None;
        self.store.clear();
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn parse_renewal_response(value: Value) -> RenewalOutcome {
    let response: RenewResponse =
        serde_json::from_value(value).map_err(|e| AuthFailure::ServerFailure {
            status: 200,
            message: format!("Malformed renewal response: {}", e),
        })?;

    if response.access_token.is_empty() || response.refresh_token.is_empty() {
        return Err(AuthFailure::ServerFailure {
            status: 200,
            message: "Renewal response contains an empty token".to_string(),
        });
    }

    Ok(CredentialPair::new(response.access_token, response.refresh_token))
}
