//! Session lifecycle: restore, login, renewal and logout.
//!
//! `SessionManager` is the only writer of session state. Consumers read
//! snapshots through a `watch` channel (or an [`AuthGate`]) and lifecycle
//! notifications through a `broadcast` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::AuthApi;

use super::claims::{self, Claims};
use super::coordinator::RefreshCoordinator;
use super::error::{AuthError, RefreshError};
use super::gate::AuthGate;
use super::ledger::{RotationEntry, RotationLedger};
use super::store::{CredentialPair, TokenStore};

/// Renew once the access token has less than this many seconds left
const DEFAULT_RENEW_MARGIN_SECS: u64 = 60;

/// Scheduled renewal attempts before a warning is surfaced
const DEFAULT_MAX_RENEWAL_ATTEMPTS: u32 = 3;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 4000;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// When and how persistently the background timer renews the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub margin: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(DEFAULT_RENEW_MARGIN_SECS),
            max_attempts: DEFAULT_MAX_RENEWAL_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RenewalPolicy {
    /// Delay after the given failed attempt (1-based): doubles from the
    /// initial backoff, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Time from `now` until the renewal timer should fire. Zero when the
    /// token is already inside the margin or expired.
    pub fn delay_until_renewal(&self, access: &Claims, now: i64) -> Duration {
        let margin = i64::try_from(self.margin.as_secs()).unwrap_or(i64::MAX);
        let fire_at = access.expires_at.saturating_sub(margin);
        Duration::from_secs(fire_at.saturating_sub(now).max(0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionPhase {
    #[default]
    Unauthenticated,
    Restoring,
    Authenticated,
    Refreshing,
    Expired,
}

/// Read-only view of the session handed to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    #[serde(skip)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub pair: Option<CredentialPair>,
    pub access_claims: Option<Claims>,
    pub refresh_claims: Option<Claims>,
    /// `Some` only when both tokens decode; compares their subjects
    pub integrity_ok: Option<bool>,
    /// Set once the startup restore has finished
    pub restored: bool,
    pub renewal_warning: Option<String>,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.pair
            .as_ref()
            .map(|p| !p.access_token.is_empty())
            .unwrap_or(false)
    }

    pub fn subject(&self) -> Option<&str> {
        self.access_claims
            .as_ref()
            .or(self.refresh_claims.as_ref())
            .map(|c| c.subject.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.pair.as_ref().map(|p| p.refresh_token.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Logout,
    RefreshDenied,
    /// Access token expired and there was no refresh token to renew it with
    Expired,
}

/// Lifecycle notifications for observers. Diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated { subject: Option<String> },
    Rotated { subject: String },
    IntegrityMismatch { access_subject: String, refresh_subject: String },
    RenewalWarning { attempts: u32, message: String },
    RevocationFailed { message: String },
    Ended { reason: EndReason },
}

/// Server-side view of the current refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    NotFound,
    Error,
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStatus::Active => write!(f, "Active"),
            TokenStatus::NotFound => write!(f, "Not Found"),
            TokenStatus::Error => write!(f, "Error"),
        }
    }
}

struct Inner {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    ledger: Arc<RotationLedger>,
    coordinator: RefreshCoordinator,
    policy: RenewalPolicy,
    state: Mutex<SessionSnapshot>,
    snapshots: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    renewal_timer: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever a session is installed or torn down
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.renewal_timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

/// Owner of the current session. Clone is cheap and shares the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<dyn TokenStore>,
        ledger: Arc<RotationLedger>,
        policy: RenewalPolicy,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                coordinator: RefreshCoordinator::new(Arc::clone(&api)),
                api,
                store,
                ledger,
                policy,
                state: Mutex::new(SessionSnapshot::default()),
                snapshots,
                events,
                renewal_timer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock_state().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn gate(&self) -> AuthGate {
        AuthGate::new(self.subscribe())
    }

    /// Rotation history of the signed-in subject, oldest first
    pub fn rotation_history(&self) -> Vec<RotationEntry> {
        match self.snapshot().subject() {
            Some(subject) => self.inner.ledger.history(subject),
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Restore the stored session on startup.
    ///
    /// An unexpired stored access token is reinstated as is. An expired (or
    /// unreadable) one is renewed with the stored refresh token. A denied
    /// renewal discards the stored session; a network failure leaves it in
    /// storage for a later attempt.
    pub async fn restore(&self) -> Result<SessionPhase, AuthError> {
        let generation = {
            let mut state = self.lock_state();
            if state.pair.is_some() {
                debug!("Session already held, nothing to restore");
                return Ok(state.phase);
            }
            state.phase = SessionPhase::Restoring;
            state.restored = false;
            self.publish(&state);
            self.inner.generation.load(Ordering::SeqCst)
        };

        let stored = match self.inner.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to load stored session");
                self.finish_restore();
                return Err(e.into());
            }
        };

        let Some(pair) = stored else {
            info!("No stored session");
            self.finish_restore();
            return Ok(SessionPhase::Unauthenticated);
        };

        let access_valid = claims::decode(&pair.access_token)
            .map(|c| !c.is_expired())
            .unwrap_or(false);
        if access_valid {
            let mut state = self.lock_state();
            self.install(&mut state, pair);
            info!(subject = ?state.subject(), "Session restored");
            return Ok(state.phase);
        }

        info!("Stored access token expired, renewing");
        let outcome = self.inner.coordinator.refresh(&pair.refresh_token).await;

        let (result, orphan) = self.apply_restore(generation, &pair, outcome);
        if let Some(orphan) = orphan {
            // The exchange rotated a token nobody holds any more
            if let Err(e) = self.inner.api.revoke(&orphan.refresh_token).await {
                debug!(error = %e, "Could not revoke token from superseded restore");
            }
        }
        result
    }

    /// Sign in with an identifier and secret
    pub async fn sign_in(&self, identifier: &str, secret: &str) -> Result<(), AuthError> {
        let pair = self
            .inner
            .api
            .login(identifier, secret)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    AuthError::NetworkFailure(e.to_string())
                } else {
                    AuthError::LoginRejected(e.to_string())
                }
            })?;
        self.login(pair);
        Ok(())
    }

    /// Make `pair` the current session, replacing whatever was there.
    pub fn login(&self, pair: CredentialPair) {
        let mut state = self.lock_state();
        self.install(&mut state, pair);
    }

    /// Renew the session now. Merges with any renewal already in flight.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let token = self
            .begin_refresh(None)
            .ok_or(AuthError::NotAuthenticated)?;
        self.finish_refresh(token).await.map_err(AuthError::from)
    }

    /// Access token for an outgoing request, renewing first if it has expired.
    pub async fn ensure_fresh(&self) -> Result<String, AuthError> {
        {
            let state = self.lock_state();
            let pair = state.pair.as_ref().ok_or(AuthError::NotAuthenticated)?;
            // Unknown expiry is left for the server to judge
            let expired = state
                .access_claims
                .as_ref()
                .is_some_and(|c| c.is_expired());
            if !expired {
                return Ok(pair.access_token.clone());
            }
        }

        self.refresh().await?;
        self.lock_state()
            .pair
            .as_ref()
            .map(|p| p.access_token.clone())
            .ok_or(AuthError::NotAuthenticated)
    }

    /// End the session. Local teardown always happens; server revocation is
    /// best effort and its failure is only reported.
    pub async fn logout(&self) {
        let revocable = {
            let mut state = self.lock_state();
            let pair = match state.pair.clone() {
                Some(pair) => Some(pair),
                // Restore may have left an unrenewed session in storage
                None => self.inner.store.load().ok().flatten(),
            };
            let subject = state
                .subject()
                .map(str::to_string)
                .or_else(|| pair.as_ref().and_then(subject_of));
            self.discard(&mut state, subject, EndReason::Logout);
            pair.map(|p| p.refresh_token)
        };

        if let Some(token) = revocable {
            if let Err(e) = self.inner.api.revoke(&token).await {
                let err = AuthError::RevocationFailed(e.to_string());
                warn!(error = %err, "Server-side logout failed");
                self.emit(SessionEvent::RevocationFailed {
                    message: e.to_string(),
                });
            }
        }
        info!("Logged out");
    }

    /// Forget the signed-in subject's rotation history
    pub fn clear_rotation_history(&self) -> Result<(), AuthError> {
        let Some(subject) = self.snapshot().subject().map(str::to_string) else {
            return Err(AuthError::NotAuthenticated);
        };
        self.inner.ledger.purge(&subject)?;
        info!(subject = %subject, "Rotation history cleared");
        Ok(())
    }

    /// Diagnostic check of the refresh token against the server
    pub async fn remote_status(&self) -> TokenStatus {
        let Some(pair) = self.snapshot().pair else {
            return TokenStatus::NotFound;
        };
        match self
            .inner
            .api
            .token_status(&pair.access_token, &pair.refresh_token)
            .await
        {
            Ok(true) => TokenStatus::Active,
            Ok(false) => TokenStatus::NotFound,
            Err(e) => {
                debug!(error = %e, "Token status check failed");
                TokenStatus::Error
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock_state(&self) -> MutexGuard<'_, SessionSnapshot> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &SessionSnapshot) {
        self.inner.snapshots.send_replace(state.clone());
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn finish_restore(&self) {
        let mut state = self.lock_state();
        state.phase = if state.pair.is_some() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        };
        state.restored = true;
        self.publish(&state);
    }

    /// Apply the outcome of the startup renewal of `stored`. Returns the
    /// restore result and, when a logout overtook the renewal, the freshly
    /// issued pair that must not be kept.
    fn apply_restore(
        &self,
        generation: u64,
        stored: &CredentialPair,
        outcome: Result<CredentialPair, RefreshError>,
    ) -> (Result<SessionPhase, AuthError>, Option<CredentialPair>) {
        let mut state = self.lock_state();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            // Signed in or logged out while the renewal was outstanding
            debug!("Restore result superseded");
            state.restored = true;
            self.publish(&state);
            let orphan = match outcome {
                Ok(pair) if state.pair.is_none() => Some(pair),
                _ => None,
            };
            return (Ok(state.phase), orphan);
        }

        let result = match outcome {
            Ok(new_pair) => {
                self.record_rotation(&stored.refresh_token, &new_pair);
                self.install(&mut state, new_pair);
                info!(subject = ?state.subject(), "Session restored after renewal");
                Ok(state.phase)
            }
            Err(RefreshError::Denied(msg)) => {
                warn!(reason = %msg, "Stored session rejected by server");
                self.discard(&mut state, subject_of(stored), EndReason::RefreshDenied);
                Err(AuthError::RefreshDenied(msg))
            }
            Err(RefreshError::Network(msg)) => {
                warn!(reason = %msg, "Could not renew stored session, keeping it for a later attempt");
                state.phase = SessionPhase::Unauthenticated;
                state.restored = true;
                self.publish(&state);
                Err(AuthError::NetworkFailure(msg))
            }
        };
        (result, None)
    }

    /// Install `pair` as the current session and re-arm the renewal timer.
    fn install(&self, state: &mut SessionSnapshot, pair: CredentialPair) {
        if let Err(e) = self.inner.store.save(&pair) {
            warn!(error = %e, "Failed to persist session");
        }

        let access_claims = claims::decode(&pair.access_token)
            .map_err(|e| debug!(error = %e, "Access token claims unavailable"))
            .ok();
        let refresh_claims = claims::decode(&pair.refresh_token)
            .map_err(|e| debug!(error = %e, "Refresh token claims unavailable"))
            .ok();
        let integrity_ok = match (&access_claims, &refresh_claims) {
            (Some(access), Some(refresh)) => Some(access.subject == refresh.subject),
            _ => None,
        };

        if let (Some(false), Some(access), Some(refresh)) =
            (integrity_ok, &access_claims, &refresh_claims)
        {
            let err = AuthError::IntegrityMismatch {
                access_subject: access.subject.clone(),
                refresh_subject: refresh.subject.clone(),
            };
            warn!(error = %err, "Token chain integrity check failed");
            self.emit(SessionEvent::IntegrityMismatch {
                access_subject: access.subject.clone(),
                refresh_subject: refresh.subject.clone(),
            });
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *state = SessionSnapshot {
            phase: SessionPhase::Authenticated,
            pair: Some(pair),
            access_claims,
            refresh_claims,
            integrity_ok,
            restored: true,
            renewal_warning: None,
        };
        self.publish(state);
        self.emit(SessionEvent::Authenticated {
            subject: state.subject().map(str::to_string),
        });
        self.schedule_renewal(state);
    }

    /// Tear down the session locally: timer, storage, ledger, state.
    fn discard(&self, state: &mut SessionSnapshot, subject: Option<String>, reason: EndReason) {
        self.cancel_renewal();

        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        if let Some(ref subject) = subject {
            if let Err(e) = self.inner.ledger.purge(subject) {
                warn!(error = %e, subject = %subject, "Failed to purge rotation history");
            }
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *state = SessionSnapshot {
            restored: true,
            ..SessionSnapshot::default()
        };
        self.publish(state);
        self.emit(SessionEvent::Ended { reason });
        info!(?reason, subject = ?subject, "Session ended");
    }

    fn record_rotation(&self, old_refresh_token: &str, new_pair: &CredentialPair) {
        if old_refresh_token == new_pair.refresh_token {
            debug!("Refresh token unchanged, no rotation to record");
            return;
        }
        let Some(subject) = subject_of(new_pair) else {
            debug!("Rotated tokens carry no readable subject, rotation not recorded");
            return;
        };
        let entry = RotationEntry::new(old_refresh_token, &new_pair.refresh_token);
        if let Err(e) = self.inner.ledger.record(&subject, entry) {
            warn!(error = %e, "Failed to record rotation");
        }
        self.emit(SessionEvent::Rotated { subject });
    }

    /// Mark the session as refreshing and return the refresh token to
    /// present. `None` when there is nothing to refresh, or when `expected`
    /// no longer names the current session.
    fn begin_refresh(&self, expected: Option<&str>) -> Option<String> {
        let mut state = self.lock_state();
        let pair = state.pair.clone()?;
        if expected.is_some_and(|token| token != pair.refresh_token) {
            return None;
        }

        let expired = state
            .access_claims
            .as_ref()
            .map(|c| c.is_expired())
            .unwrap_or(false);

        if pair.refresh_token.is_empty() {
            if expired {
                let subject = state.subject().map(str::to_string);
                self.discard(&mut state, subject, EndReason::Expired);
            }
            return None;
        }

        if expired && !self.inner.coordinator.in_flight(&pair.refresh_token) {
            state.phase = SessionPhase::Expired;
            self.publish(&state);
        }
        state.phase = SessionPhase::Refreshing;
        self.publish(&state);
        Some(pair.refresh_token)
    }

    /// Run the exchange for `old_token` and apply its outcome, unless the
    /// session moved on while it was outstanding.
    async fn finish_refresh(&self, old_token: String) -> Result<(), RefreshError> {
        let outcome = self.inner.coordinator.refresh(&old_token).await;

        let mut state = self.lock_state();
        if state.refresh_token() != Some(old_token.as_str()) {
            // Already applied by another caller, or logged out meanwhile
            debug!("Refresh outcome superseded");
            return outcome.map(|_| ());
        }

        match outcome {
            Ok(pair) => {
                self.record_rotation(&old_token, &pair);
                self.install(&mut state, pair);
                debug!("Session refreshed");
                Ok(())
            }
            Err(RefreshError::Denied(msg)) => {
                warn!(reason = %msg, "Refresh denied, ending session");
                let subject = state.subject().map(str::to_string);
                self.discard(&mut state, subject, EndReason::RefreshDenied);
                Err(RefreshError::Denied(msg))
            }
            Err(RefreshError::Network(msg)) => {
                let expired = state
                    .access_claims
                    .as_ref()
                    .map(|c| c.is_expired())
                    .unwrap_or(false);
                state.phase = if expired {
                    SessionPhase::Expired
                } else {
                    SessionPhase::Authenticated
                };
                self.publish(&state);
                Err(RefreshError::Network(msg))
            }
        }
    }

    // ========================================================================
    // Renewal timer
    // ========================================================================

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .renewal_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_renewal(&self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }

    /// Replace any pending renewal with one for the session in `state`.
    fn schedule_renewal(&self, state: &SessionSnapshot) {
        self.cancel_renewal();

        let (Some(pair), Some(access)) = (state.pair.as_ref(), state.access_claims.as_ref()) else {
            debug!("Access token expiry unknown, no renewal scheduled");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, automatic renewal disabled");
            return;
        };

        let delay = self
            .inner
            .policy
            .delay_until_renewal(access, Utc::now().timestamp());
        let scheduled_for = pair.refresh_token.clone();
        let inner = Arc::downgrade(&self.inner);
        debug!(delay_secs = delay.as_secs(), "Renewal scheduled");

        *self.lock_timer() = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::run_renewal(inner, scheduled_for).await;
        }));
    }

    /// Body of the renewal timer. Retries transient failures with backoff
    /// capped at `max_backoff` until the exchange succeeds, is denied, or
    /// the session changes. A warning is raised once `max_attempts` have
    /// failed; a transient failure never logs out.
    async fn run_renewal(inner: Weak<Inner>, scheduled_for: String) {
        let mut attempt: u32 = 0;
        loop {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let manager = SessionManager { inner };

            // Logged out or replaced since this timer was armed
            let Some(token) = manager.begin_refresh(Some(&scheduled_for)) else {
                debug!("Renewal timer fired for a stale session, ignoring");
                return;
            };

            attempt = attempt.saturating_add(1);
            match manager.finish_refresh(token).await {
                Ok(()) | Err(RefreshError::Denied(_)) => return,
                Err(RefreshError::Network(msg)) => {
                    let policy = manager.inner.policy.clone();
                    if attempt == policy.max_attempts {
                        manager.raise_renewal_warning(attempt, msg.clone());
                    }
                    let backoff = policy.backoff(attempt);
                    warn!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %msg,
                        "Scheduled renewal failed, backing off"
                    );
                    drop(manager);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn raise_renewal_warning(&self, attempts: u32, message: String) {
        warn!(attempts = attempts, error = %message, "Automatic renewal keeps failing");
        let mut state = self.lock_state();
        state.renewal_warning = Some(format!(
            "Session renewal failed {} times: {}",
            attempts, message
        ));
        self.publish(&state);
        self.emit(SessionEvent::RenewalWarning { attempts, message });
    }
}

fn subject_of(pair: &CredentialPair) -> Option<String> {
    claims::decode(&pair.access_token)
        .or_else(|_| claims::decode(&pair.refresh_token))
        .map(|c| c.subject)
        .ok()
}
