// Access token claim decoding
// Signatures are not verified here; that is the remote service's job

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use chrono::Utc;

use super::types::Claims;

/// Tokens shorter than this are never considered valid
pub const MIN_TOKEN_LENGTH: usize = 10;

/// URL-safe alphabet that accepts both padded and unpadded input
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Result of looking inside a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenInspection {
    /// Empty or missing token
    Absent,
    /// Token present but its payload could not be decoded
    Malformed(String),
    /// Payload decoded into claims
    Valid(Claims),
}

/// Inspect a token, distinguishing absent, malformed and valid claims
pub fn inspect(token: &str) -> TokenInspection {
    if token.is_empty() {
        return TokenInspection::Absent;
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return TokenInspection::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        ));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return TokenInspection::Malformed("empty segment".to_string());
    }

    // Accept the standard alphabet too
    let payload = segments[1].replace('+', "-").replace('/', "_");
    let bytes = match PAYLOAD_ENGINE.decode(payload.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return TokenInspection::Malformed(format!("payload is not base64: {}", e)),
    };

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => return TokenInspection::Malformed(format!("payload is not JSON: {}", e)),
    };
    if !value.is_object() {
        return TokenInspection::Malformed("payload is not a JSON object".to_string());
    }

    match serde_json::from_value::<Claims>(value) {
        Ok(claims) => TokenInspection::Valid(claims),
        Err(e) => TokenInspection::Malformed(format!("invalid claims: {}", e)),
    }
}

/// Decode the claims of a token, or `None` if the token is absent or malformed
pub fn decode_claims(token: &str) -> Option<Claims> {
    match inspect(token) {
        TokenInspection::Valid(claims) => Some(claims),
        TokenInspection::Malformed(reason) => {
            tracing::debug!(reason = %reason, "Token claims could not be decoded");
            None
        }
        TokenInspection::Absent => None,
    }
}

/// Check expiry against the current wall clock
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now().timestamp())
}

/// Check expiry against an explicit time in epoch seconds
/// `exp` is exclusive (expired at the instant), `nbf` is inclusive (valid at the instant)
pub fn is_expired_at(token: &str, now_secs: i64) -> bool {
    if token.len() < MIN_TOKEN_LENGTH {
        return true;
    }

    let Some(claims) = decode_claims(token) else {
        return true;
    };

    if let Some(exp) = claims.expires_at {
        if now_secs >= exp {
            return true;
        }
    }

    if let Some(nbf) = claims.not_before {
        if now_secs < nbf {
            return true;
        }
    }

    false
}

/// Build an unsigned token around the given payload (tests and fixtures)
#[cfg(any(test, feature = "test-utils"))]
pub fn encode_unsigned(payload: &serde_json::Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.c2lnbmF0dXJl", header, body)
}
