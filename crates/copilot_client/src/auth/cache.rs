use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::exchange::TokenExchange;
use super::token::{PrimaryCredential, ServiceToken};
use crate::error::AuthError;

type RefreshFuture = Shared<BoxFuture<'static, Result<ServiceToken, AuthError>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

#[derive(Default)]
struct CacheState {
    credential: Option<PrimaryCredential>,
    token: Option<ServiceToken>,
    in_flight: Option<InFlight>,
    next_refresh_id: u64,
    refresh_count: u32,
    last_error: Option<AuthError>,
}

/// Credential-free view of the cache, used for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub has_credential: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
    pub refreshing: bool,
    pub last_error: Option<AuthError>,
}

/// Holds the current service token and single-flights its refresh.
///
/// The mutex only guards the decision "valid / refreshing / start a
/// refresh"; the exchange itself runs outside it as a shared future that
/// every concurrent caller awaits.
pub struct TokenCache {
    exchanger: Arc<dyn TokenExchange>,
    safety_margin: Duration,
    state: Mutex<CacheState>,
}

impl TokenCache {
    pub fn new(exchanger: Arc<dyn TokenExchange>, safety_margin: Duration) -> Self {
        Self {
            exchanger,
            safety_margin,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Replace the primary credential. The previous service token and any
    /// refresh still running for the old credential are dropped.
    pub async fn set_credential(&self, credential: PrimaryCredential) {
        let mut state = self.state.lock().await;
        state.credential = Some(credential);
        state.token = None;
        state.in_flight = None;
        state.last_error = None;
    }

    /// The primary credential currently installed, if any.
    pub async fn credential(&self) -> Option<PrimaryCredential> {
        self.state.lock().await.credential.clone()
    }

    pub async fn get(&self) -> Result<ServiceToken, AuthError> {
        self.get_valid_token(Utc::now()).await
    }

    /// Return a token valid beyond `now + safety_margin`, refreshing if needed.
    pub async fn get_valid_token(&self, now: DateTime<Utc>) -> Result<ServiceToken, AuthError> {
        let (id, future) = {
            let mut state = self.state.lock().await;
            if let Some(token) = &state.token {
                if token.is_valid_at(now, self.safety_margin) {
                    return Ok(token.clone());
                }
                debug!(
                    "Service token expires at {}, refreshing",
                    token.expires_at().to_rfc3339()
                );
                state.token = None;
            }

            match &state.in_flight {
                Some(in_flight) => {
                    debug!("Joining refresh #{} already in flight", in_flight.id);
                    (in_flight.id, in_flight.future.clone())
                }
                None => {
                    let credential = state.credential.clone().ok_or(AuthError::LoginRequired)?;
                    let refresh_count = state.refresh_count + 1;
                    let exchanger = Arc::clone(&self.exchanger);
                    let future = async move {
                        exchanger
                            .exchange(&credential)
                            .await
                            .map(|token| token.with_refresh_count(refresh_count))
                    }
                    .boxed()
                    .shared();

                    state.next_refresh_id += 1;
                    let id = state.next_refresh_id;
                    state.in_flight = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    debug!("Starting refresh #{id}");
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock().await;
        if state.in_flight.as_ref().map(|f| f.id) == Some(id) {
            state.in_flight = None;
            match &result {
                Ok(token) => {
                    state.refresh_count = token.refresh_count();
                    state.token = Some(token.clone());
                    state.last_error = None;
                    info!(
                        "Service token refreshed (#{}), valid until {}",
                        token.refresh_count(),
                        token.expires_at().to_rfc3339()
                    );
                }
                Err(e) => {
                    state.token = None;
                    if e.requires_login() || matches!(e, AuthError::SubscriptionRequired(_)) {
                        state.credential = None;
                    }
                    state.last_error = Some(e.clone());
                    warn!("Service token refresh failed: {e}");
                }
            }
        }
        result
    }

    /// Drop `stale` if it is still the cached token so the next call refreshes.
    ///
    /// A token already superseded by another caller's refresh is left alone.
    pub async fn invalidate(&self, stale: &ServiceToken) {
        let mut state = self.state.lock().await;
        if state.token.as_ref() == Some(stale) {
            debug!("Invalidating service token #{}", stale.refresh_count());
            state.token = None;
        }
    }

    /// Forget everything, but only while `credential` is still the installed one.
    pub async fn clear_if_credential(&self, credential: &PrimaryCredential) {
        let mut state = self.state.lock().await;
        if state.credential.as_ref() == Some(credential) {
            debug!("Dropping credential of a superseded login");
            state.credential = None;
            state.token = None;
            state.in_flight = None;
        }
    }

    /// Forget every credential held in memory.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let refresh_count = state.refresh_count;
        *state = CacheState {
            refresh_count,
            ..CacheState::default()
        };
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.lock().await;
        CacheSnapshot {
            has_credential: state.credential.is_some(),
            token_expires_at: state.token.as_ref().map(|t| t.expires_at()),
            refresh_count: state.refresh_count,
            refreshing: state.in_flight.is_some(),
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts exchanges; each one takes `delay` and yields `result`.
    struct CountingExchanger {
        calls: AtomicUsize,
        delay: Duration,
        lifetime: chrono::Duration,
        fail_with: Option<AuthError>,
    }

    impl CountingExchanger {
        fn ok(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                lifetime: chrono::Duration::minutes(30),
                fail_with: None,
            })
        }

        fn failing(error: AuthError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                lifetime: chrono::Duration::minutes(30),
                fail_with: Some(error),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchange for CountingExchanger {
        async fn exchange(
            &self,
            credential: &PrimaryCredential,
        ) -> Result<ServiceToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(ServiceToken::new(
                    format!("{}-service-{n}", credential.token()),
                    Utc::now() + self.lifetime,
                )),
            }
        }
    }

    fn margin() -> Duration {
        Duration::from_secs(60)
    }

    #[tokio::test]
    async fn no_credential_requires_login() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        assert_eq!(cache.get().await, Err(AuthError::LoginRequired));
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn valid_token_is_served_without_io() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let first = cache.get().await.expect("token");
        let second = cache.get().await.expect("token");

        assert_eq!(first, second);
        assert_eq!(first.refresh_count(), 1);
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_exchange() {
        let exchanger = CountingExchanger::ok(Duration::from_millis(200));
        let cache = Arc::new(TokenCache::new(exchanger.clone(), margin()));
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.expect("join").expect("token"));
        }

        assert_eq!(exchanger.calls(), 1);
        assert!(results.iter().all(|t| t == &results[0]));
        assert_eq!(cache.snapshot().await.refresh_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let exchanger = CountingExchanger::failing(AuthError::Unauthorized);
        let cache = Arc::new(TokenCache::new(exchanger.clone(), margin()));
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.expect("join"), Err(AuthError::Unauthorized));
        }
        assert_eq!(exchanger.calls(), 1);

        let snapshot = cache.snapshot().await;
        assert!(!snapshot.has_credential);
        assert_eq!(snapshot.token_expires_at, None);
        assert_eq!(snapshot.last_error, Some(AuthError::Unauthorized));
        assert_eq!(cache.get().await, Err(AuthError::LoginRequired));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_not_served() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let first = cache.get().await.expect("token");
        let later = first.expires_at() + chrono::Duration::seconds(1);
        let second = cache.get_valid_token(later).await.expect("token");

        assert_ne!(first, second);
        assert_eq!(second.refresh_count(), 2);
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn token_inside_safety_margin_is_refreshed() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let first = cache.get().await.expect("token");
        let inside_margin = first.expires_at() - chrono::Duration::seconds(30);
        cache.get_valid_token(inside_margin).await.expect("token");
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn network_failure_keeps_credential_but_drops_token() {
        let exchanger = CountingExchanger::failing(AuthError::Network("timeout".into()));
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;

        assert!(matches!(cache.get().await, Err(AuthError::Network(_))));
        let snapshot = cache.snapshot().await;
        assert!(snapshot.has_credential);
        assert_eq!(snapshot.token_expires_at, None);

        assert!(matches!(cache.get().await, Err(AuthError::Network(_))));
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_only_drops_matching_token() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;

        let first = cache.get().await.expect("token");
        cache.invalidate(&first).await;
        let second = cache.get().await.expect("token");
        assert_eq!(exchanger.calls(), 2);

        cache.invalidate(&first).await;
        let third = cache.get().await.expect("token");
        assert_eq!(second, third);
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn clear_if_credential_leaves_newer_login_alone() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        let old = PrimaryCredential::new("gho_old");
        cache.set_credential(old.clone()).await;
        cache.set_credential(PrimaryCredential::new("gho_new")).await;

        cache.clear_if_credential(&old).await;
        assert!(cache.snapshot().await.has_credential);

        cache.clear_if_credential(&PrimaryCredential::new("gho_new")).await;
        assert_eq!(cache.get().await, Err(AuthError::LoginRequired));
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn clear_forgets_credentials() {
        let exchanger = CountingExchanger::ok(Duration::ZERO);
        let cache = TokenCache::new(exchanger.clone(), margin());
        cache.set_credential(PrimaryCredential::new("gho")).await;
        cache.get().await.expect("token");

        cache.clear().await;

        let snapshot = cache.snapshot().await;
        assert!(!snapshot.has_credential);
        assert_eq!(snapshot.token_expires_at, None);
        assert_eq!(cache.get().await, Err(AuthError::LoginRequired));
    }
}
