// Authentication types

use serde::{Deserialize, Serialize};

/// Short-lived and long-lived credentials, always persisted together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Which half of the pair to read from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    AccessToken,
    RefreshToken,
}

impl CredentialKind {
    /// Persistence key for this credential
    pub fn storage_key(&self) -> &'static str {
        match self {
            CredentialKind::AccessToken => "auth.access_token",
            CredentialKind::RefreshToken => "auth.refresh_token",
        }
    }
}

/// Claims embedded in the access token payload
/// All fields are optional; absent `exp` means non-expiring, absent `nbf` means valid now
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,

    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    #[serde(rename = "nbf", default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
}

/// Snapshot of the signed-in user, persisted next to the credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Renewal response body
#[derive(Debug, Deserialize)]
pub struct RenewResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// Lifecycle notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A renewal succeeded and the new pair was persisted
    TokenRefresh(CredentialPair),
    /// All credentials were cleared after an authoritative rejection or logout
    Logout,
}

/// Introspection snapshot for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub renewal_in_progress: bool,
}
