//! Unverified decoding of bearer token claims.
//!
//! Tokens are treated as three dot-separated base64url segments whose middle
//! segment is a JSON claims object. Signatures are never checked: the issuer
//! is trusted and claims are only used for identity display and expiry.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::utils::format_countdown;

/// Number of dot-separated segments in a bearer token
const TOKEN_SEGMENTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),
}

/// Claims carried in a token's payload segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Claims {
    #[serde(rename = "sub")]
    pub subject: String,
    /// Issued-at, epoch seconds
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Expires-at, epoch seconds
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "iss", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    /// Seconds until expiry (negative once expired)
    pub fn seconds_remaining(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now)
    }

    /// Countdown until expiry for display, e.g. "14m 5s" or "Expired"
    pub fn countdown(&self) -> String {
        format_countdown(self.seconds_remaining(Utc::now().timestamp()))
    }
}

/// Decode the claims of a bearer token without verifying its signature.
pub fn decode(token: &str) -> Result<Claims, ClaimsError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != TOKEN_SEGMENTS {
        return Err(ClaimsError::MalformedToken(format!(
            "expected {} segments, found {}",
            TOKEN_SEGMENTS,
            segments.len()
        )));
    }

    // Some issuers pad their segments; the URL-safe alphabet itself is strict
    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ClaimsError::MalformedToken(format!("invalid base64 payload: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| ClaimsError::MalformedToken(format!("invalid claims JSON: {}", e)))
}

/// Build an unsigned token around the given claims.
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &Claims) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}
