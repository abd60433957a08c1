//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::api::{ApiError, AuthApi};
use crate::auth::claims::{self, encode_unsigned, Claims};
use crate::auth::{CredentialPair, RefreshError};

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Unsigned token for `subject` expiring `ttl_secs` from now (negative = already expired)
pub(crate) fn mint_token(subject: &str, ttl_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let mut extra = Map::new();
    let nonce = NONCE.fetch_add(1, Ordering::SeqCst);
    extra.insert("jti".to_string(), Value::from(nonce));
    let token = encode_unsigned(&Claims {
        subject: subject.to_string(),
        issued_at: now,
        expires_at: now + ttl_secs,
        issuer: Some("auth.example.com".to_string()),
        extra,
    });
    // Vary the signature too so masked forms differ between tokens
    let (unsigned, _) = token.rsplit_once('.').expect("three segments");
    format!("{}.sig-{:012}", unsigned, nonce)
}

pub(crate) fn mint_pair(subject: &str, access_ttl: i64, refresh_ttl: i64) -> CredentialPair {
    CredentialPair::new(mint_token(subject, access_ttl), mint_token(subject, refresh_ttl))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshBehavior {
    /// New access token and a new refresh token
    Rotate,
    /// New access token, same refresh token
    Renew,
    Deny,
    NetworkDown,
}

pub(crate) struct MockApi {
    behavior: Mutex<RefreshBehavior>,
    delay: Duration,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
    revoke_fails: AtomicBool,
}

impl MockApi {
    pub(crate) fn new(behavior: RefreshBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: Duration::ZERO,
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            revoke_fails: AtomicBool::new(false),
        }
    }

    /// Hold every refresh exchange open for `delay`
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: RefreshBehavior) {
        *self.behavior.lock().expect("behavior lock") = behavior;
    }

    pub(crate) fn fail_revocations(&self) {
        self.revoke_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for MockApi {
    async fn login(&self, identifier: &str, secret: &str) -> Result<CredentialPair, ApiError> {
        if secret == "wrong" {
            return Err(ApiError::Rejected("Invalid credentials".to_string()));
        }
        Ok(mint_pair(identifier, 900, 7 * 86_400))
    }

    async fn register(&self, _identifier: &str, _secret: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, RefreshError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let behavior = *self.behavior.lock().expect("behavior lock");
        let subject = claims::decode(refresh_token)
            .map(|c| c.subject)
            .unwrap_or_else(|_| "unknown".to_string());
        match behavior {
            RefreshBehavior::Rotate => Ok(mint_pair(&subject, 900, 7 * 86_400)),
            RefreshBehavior::Renew => Ok(CredentialPair::new(
                mint_token(&subject, 900),
                refresh_token,
            )),
            RefreshBehavior::Deny => Err(RefreshError::Denied("Invalid refresh token".to_string())),
            RefreshBehavior::NetworkDown => Err(RefreshError::Network("connection refused".to_string())),
        }
    }

    async fn revoke(&self, _refresh_token: &str) -> Result<(), ApiError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if self.revoke_fails.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("revocation store unavailable".to_string()));
        }
        Ok(())
    }

    async fn token_status(&self, _access_token: &str, _refresh_token: &str) -> Result<bool, ApiError> {
        Ok(true)
    }
}
