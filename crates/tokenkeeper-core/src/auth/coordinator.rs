//! De-duplication of refresh exchanges.
//!
//! The server rotates the refresh token on every successful exchange, so two
//! concurrent exchanges for the same token race: the loser presents a token
//! the winner already invalidated. Every caller asking to refresh a token that
//! is already being exchanged attaches to the outstanding call instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::api::AuthApi;
use crate::utils::mask_token;

use super::error::RefreshError;
use super::store::CredentialPair;

type RefreshOutcome = Result<CredentialPair, RefreshError>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;
type PendingSlots = Arc<Mutex<HashMap<String, PendingRefresh>>>;

pub struct RefreshCoordinator {
    api: Arc<dyn AuthApi>,
    pending: PendingSlots,
}

impl RefreshCoordinator {
    pub fn new(api: Arc<dyn AuthApi>) -> Self {
        Self {
            api,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Exchange `refresh_token` for a new pair, sharing any exchange already
    /// in flight for the same token.
    pub async fn refresh(&self, refresh_token: &str) -> RefreshOutcome {
        let call = {
            let mut pending = lock_slots(&self.pending);
            match pending.get(refresh_token) {
                Some(existing) => {
                    debug!(token = %mask_token(refresh_token), "Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let call = Self::exchange(
                        Arc::clone(&self.api),
                        Arc::clone(&self.pending),
                        refresh_token.to_string(),
                    );
                    pending.insert(refresh_token.to_string(), call.clone());
                    call
                }
            }
        };
        call.await
    }

    /// Whether an exchange for `refresh_token` is currently outstanding
    pub fn in_flight(&self, refresh_token: &str) -> bool {
        lock_slots(&self.pending).contains_key(refresh_token)
    }

    fn exchange(api: Arc<dyn AuthApi>, slots: PendingSlots, token: String) -> PendingRefresh {
        async move {
            debug!(token = %mask_token(&token), "Starting refresh exchange");
            let outcome = api.refresh(&token).await;
            // Free the slot before any waiter observes the outcome
            lock_slots(&slots).remove(&token);
            outcome
        }
        .boxed()
        .shared()
    }
}

fn lock_slots(slots: &PendingSlots) -> MutexGuard<'_, HashMap<String, PendingRefresh>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mint_pair, MockApi, RefreshBehavior};
    use futures::future::join_all;
    use std::time::Duration;

    const DAY: i64 = 86_400;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_call() {
        let api = Arc::new(MockApi::new(RefreshBehavior::Rotate).with_delay(Duration::from_millis(50)));
        let coordinator = RefreshCoordinator::new(api.clone());
        let pair = mint_pair("user-1", 900, 7 * DAY);

        let results = join_all((0..5).map(|_| coordinator.refresh(&pair.refresh_token))).await;

        assert_eq!(api.refresh_calls(), 1);
        let first = results[0].clone().expect("refresh succeeds");
        assert_ne!(first.refresh_token, pair.refresh_token);
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert!(!coordinator.in_flight(&pair.refresh_token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_are_shared() {
        let api = Arc::new(MockApi::new(RefreshBehavior::Deny).with_delay(Duration::from_millis(50)));
        let coordinator = RefreshCoordinator::new(api.clone());
        let pair = mint_pair("user-1", 900, 7 * DAY);

        let results = join_all((0..3).map(|_| coordinator.refresh(&pair.refresh_token))).await;

        assert_eq!(api.refresh_calls(), 1);
        assert!(results.iter().all(|r| matches!(r, Err(RefreshError::Denied(_)))));
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_sequential_refreshes_start_fresh_calls() {
        let api = Arc::new(MockApi::new(RefreshBehavior::NetworkDown));
        let coordinator = RefreshCoordinator::new(api.clone());
        let pair = mint_pair("user-1", 900, 7 * DAY);

        let first = coordinator.refresh(&pair.refresh_token).await;
        assert!(matches!(first, Err(RefreshError::Network(_))));
        assert!(!coordinator.in_flight(&pair.refresh_token));

        let second = coordinator.refresh(&pair.refresh_token).await;
        assert!(matches!(second, Err(RefreshError::Network(_))));
        assert_eq!(api.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_tokens_are_not_merged() {
        let api = Arc::new(MockApi::new(RefreshBehavior::Rotate).with_delay(Duration::from_millis(50)));
        let coordinator = RefreshCoordinator::new(api.clone());
        let a = mint_pair("user-1", 900, 7 * DAY);
        let b = mint_pair("user-2", 900, 7 * DAY);

        let (ra, rb) = tokio::join!(
            coordinator.refresh(&a.refresh_token),
            coordinator.refresh(&b.refresh_token)
        );

        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(api.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_reports_outstanding_call() {
        let api = Arc::new(MockApi::new(RefreshBehavior::Rotate).with_delay(Duration::from_secs(5)));
        let coordinator = Arc::new(RefreshCoordinator::new(api.clone()));
        let pair = mint_pair("user-1", 900, 7 * DAY);

        let task = {
            let coordinator = Arc::clone(&coordinator);
            let token = pair.refresh_token.clone();
            tokio::spawn(async move { coordinator.refresh(&token).await })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.in_flight(&pair.refresh_token));

        task.await.expect("join").expect("refresh succeeds");
        assert!(!coordinator.in_flight(&pair.refresh_token));
    }
}
