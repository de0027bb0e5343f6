use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::cache::TokenCache;
use super::device_code::{present_device_code, DeviceAuthorization, DeviceFlowApi};
use super::poller::{AuthorizationPoller, PollOutcome};
use super::state::AuthState;
use super::token::{PrimaryCredential, ServiceToken};
use crate::error::AuthError;

/// A device authorization that has been shown to the user but not yet polled.
#[derive(Debug)]
pub struct PendingLogin {
    pub device: DeviceAuthorization,
    attempt: u64,
    cancel: CancellationToken,
}

impl PendingLogin {
    /// Signal that cancels this attempt's poller.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Default)]
struct ActiveLogin {
    attempt: u64,
    cancel: Option<CancellationToken>,
}

/// Runs the login flow and tracks the process-wide auth state.
///
/// At most one device flow is active: starting a new one cancels the
/// previous poller.
pub struct CopilotAuthHandler {
    device_flow: Arc<dyn DeviceFlowApi>,
    cache: Arc<TokenCache>,
    client_id: String,
    scopes: Vec<String>,
    headless_auth: bool,
    state: Mutex<AuthState>,
    active: Mutex<ActiveLogin>,
}

impl CopilotAuthHandler {
    pub fn new(
        device_flow: Arc<dyn DeviceFlowApi>,
        cache: Arc<TokenCache>,
        client_id: impl Into<String>,
        scopes: Vec<String>,
        headless_auth: bool,
    ) -> Self {
        CopilotAuthHandler {
            device_flow,
            cache,
            client_id: client_id.into(),
            scopes,
            headless_auth,
            state: Mutex::new(AuthState::Unauthenticated),
            active: Mutex::new(ActiveLogin::default()),
        }
    }

    pub fn cache(&self) -> Arc<TokenCache> {
        Arc::clone(&self.cache)
    }

    /// Full interactive login: request a code, show it, poll, exchange.
    pub async fn login(&self) -> Result<ServiceToken, AuthError> {
        let pending = self.start_authentication().await?;
        present_device_code(&pending.device, self.headless_auth);
        self.complete_authentication(pending).await
    }

    /// Request a device code. Cancels any login still in progress.
    pub async fn start_authentication(&self) -> Result<PendingLogin, AuthError> {
        let (attempt, cancel) = {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.cancel.take() {
                info!("Cancelling login attempt #{}", active.attempt);
                previous.cancel();
            }
            active.attempt += 1;
            let cancel = CancellationToken::new();
            active.cancel = Some(cancel.clone());
            (active.attempt, cancel)
        };

        let device = match self
            .device_flow
            .request_device_authorization(&self.client_id, &self.scopes)
            .await
        {
            Ok(device) => device,
            Err(e) => {
                error!("Failed to request device code: {e}");
                self.finish_attempt(attempt, AuthState::Error(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        if self.is_current(attempt).await {
            *self.state.lock().await = AuthState::PendingDeviceAuthorization;
        }
        Ok(PendingLogin {
            device,
            attempt,
            cancel,
        })
    }

    /// Poll until the user approves, then exchange for the first service token.
    pub async fn complete_authentication(
        &self,
        pending: PendingLogin,
    ) -> Result<ServiceToken, AuthError> {
        let poller = AuthorizationPoller::new(Arc::clone(&self.device_flow), self.client_id.clone());
        let outcome = poller.poll(pending.device, &pending.cancel).await;

        let credential = match outcome {
            Ok(PollOutcome::Success(credential)) => credential,
            Ok(PollOutcome::Cancelled) => {
                self.finish_attempt(pending.attempt, AuthState::Unauthenticated)
                    .await;
                return Err(AuthError::Cancelled);
            }
            Ok(PollOutcome::Denied) => {
                self.finish_attempt(pending.attempt, AuthState::Denied).await;
                return Err(AuthError::Denied);
            }
            Ok(PollOutcome::Expired) => {
                self.finish_attempt(pending.attempt, AuthState::Expired).await;
                return Err(AuthError::DeviceCodeExpired);
            }
            Err(e) => {
                self.finish_attempt(pending.attempt, AuthState::Error(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        if !self.is_current(pending.attempt).await {
            return Err(AuthError::Cancelled);
        }
        self.install_credential(credential, pending.attempt).await
    }

    /// Log in with a GitHub token the user already has, skipping the device flow.
    pub async fn login_with_token(&self, token: impl Into<String>) -> Result<ServiceToken, AuthError> {
        let attempt = self.supersede_login().await;
        self.install_credential(PrimaryCredential::new(token), attempt)
            .await
    }

    /// Install `credential` and run the first exchange on behalf of `attempt`.
    ///
    /// If a logout or another login superseded the attempt meanwhile, the
    /// credential is taken back out of the cache and the login reports
    /// `Cancelled`.
    async fn install_credential(
        &self,
        credential: PrimaryCredential,
        attempt: u64,
    ) -> Result<ServiceToken, AuthError> {
        self.cache.set_credential(credential.clone()).await;
        let result = self.cache.get().await;

        if !self.is_current(attempt).await {
            info!("Login attempt #{attempt} was superseded during the token exchange");
            self.cache.clear_if_credential(&credential).await;
            return Err(AuthError::Cancelled);
        }

        let state = match &result {
            Ok(_) => {
                info!("Login complete");
                AuthState::Authenticated
            }
            Err(e) if e.requires_login() => AuthState::Unauthenticated,
            Err(e) => AuthState::Error(e.to_string()),
        };
        self.finish_attempt(attempt, state).await;
        result
    }

    /// Abort the running device flow, if any.
    pub async fn cancel_login(&self) {
        self.supersede_login().await;
    }

    /// Invalidate every attempt in progress and return a fresh attempt number.
    async fn supersede_login(&self) -> u64 {
        let mut active = self.active.lock().await;
        if let Some(cancel) = active.cancel.take() {
            info!("Cancelling login attempt #{}", active.attempt);
            cancel.cancel();
            let mut state = self.state.lock().await;
            if *state == AuthState::PendingDeviceAuthorization {
                *state = AuthState::Unauthenticated;
            }
        }
        active.attempt += 1;
        active.attempt
    }

    /// Cancel any login and forget every in-memory credential.
    pub async fn logout(&self) {
        self.cancel_login().await;
        self.cache.clear().await;
        *self.state.lock().await = AuthState::Unauthenticated;
        info!("Logged out, in-memory credentials cleared");
    }

    /// Current state, reconciled with what the token cache still holds.
    pub async fn status(&self) -> AuthState {
        let state = self.state.lock().await.clone();
        if state != AuthState::Authenticated {
            return state;
        }
        let snapshot = self.cache.snapshot().await;
        if snapshot.has_credential {
            return AuthState::Authenticated;
        }
        match snapshot.last_error {
            Some(AuthError::SubscriptionRequired(reason)) => AuthState::Error(reason),
            _ => AuthState::Unauthenticated,
        }
    }

    async fn is_current(&self, attempt: u64) -> bool {
        self.active.lock().await.attempt == attempt
    }

    /// Record a terminal state unless a newer attempt has taken over.
    async fn finish_attempt(&self, attempt: u64, state: AuthState) {
        let mut active = self.active.lock().await;
        if active.attempt != attempt {
            return;
        }
        active.cancel = None;
        *self.state.lock().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::device_code::TokenPollResponse;
    use crate::auth::exchange::TokenExchange;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeDeviceFlow {
        answer: TokenPollResponse,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl DeviceFlowApi for FakeDeviceFlow {
        async fn request_device_authorization(
            &self,
            _client_id: &str,
            _scopes: &[String],
        ) -> Result<DeviceAuthorization, AuthError> {
            Ok(DeviceAuthorization::new(
                "device",
                "ABCD-EFGH",
                "https://github.com/login/device",
                Duration::from_secs(900),
                Duration::from_secs(5),
            )?)
        }

        async fn poll_token(
            &self,
            _client_id: &str,
            _device_code: &str,
        ) -> Result<TokenPollResponse, AuthError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    struct FakeExchanger {
        result: Result<(), AuthError>,
        delay: Duration,
    }

    #[async_trait]
    impl TokenExchange for FakeExchanger {
        async fn exchange(
            &self,
            credential: &PrimaryCredential,
        ) -> Result<ServiceToken, AuthError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone().map(|_| {
                ServiceToken::new(
                    format!("{}-service", credential.token()),
                    Utc::now() + chrono::Duration::minutes(30),
                )
            })
        }
    }

    fn handler(answer: TokenPollResponse, exchange: Result<(), AuthError>) -> CopilotAuthHandler {
        slow_handler(answer, exchange, Duration::ZERO)
    }

    fn slow_handler(
        answer: TokenPollResponse,
        exchange: Result<(), AuthError>,
        delay: Duration,
    ) -> CopilotAuthHandler {
        let device_flow = Arc::new(FakeDeviceFlow {
            answer,
            polls: AtomicUsize::new(0),
        });
        let cache = Arc::new(TokenCache::new(
            Arc::new(FakeExchanger {
                result: exchange,
                delay,
            }),
            Duration::from_secs(60),
        ));
        CopilotAuthHandler::new(device_flow, cache, "client", vec!["read:user".into()], true)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_login_authenticates() {
        let handler = handler(
            TokenPollResponse::Success(PrimaryCredential::new("gho_user")),
            Ok(()),
        );
        assert_eq!(handler.status().await, AuthState::Unauthenticated);

        let pending = handler.start_authentication().await.expect("device code");
        assert_eq!(handler.status().await, AuthState::PendingDeviceAuthorization);

        let token = handler.complete_authentication(pending).await.expect("login");
        assert_eq!(token.token(), "gho_user-service");
        assert_eq!(handler.status().await, AuthState::Authenticated);

        handler.logout().await;
        assert_eq!(handler.status().await, AuthState::Unauthenticated);
        assert_eq!(handler.cache().get().await, Err(AuthError::LoginRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_login_sets_denied_state() {
        let handler = handler(TokenPollResponse::Denied, Ok(()));
        let pending = handler.start_authentication().await.expect("device code");
        assert_eq!(
            handler.complete_authentication(pending).await,
            Err(AuthError::Denied)
        );
        assert_eq!(handler.status().await, AuthState::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn new_login_cancels_previous_one() {
        let handler = Arc::new(handler(TokenPollResponse::Pending, Ok(())));

        let first = handler.start_authentication().await.expect("device code");
        let first_cancel = first.cancellation();
        let polling = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.complete_authentication(first).await })
        };
        tokio::time::sleep(Duration::from_secs(12)).await;

        let _second = handler.start_authentication().await.expect("device code");
        assert!(first_cancel.is_cancelled());
        assert_eq!(polling.await.expect("join"), Err(AuthError::Cancelled));
        assert_eq!(handler.status().await, AuthState::PendingDeviceAuthorization);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_failure_is_reported_as_error() {
        let handler = handler(
            TokenPollResponse::Success(PrimaryCredential::new("gho_user")),
            Err(AuthError::SubscriptionRequired("no seat".into())),
        );
        let pending = handler.start_authentication().await.expect("device code");
        assert_eq!(
            handler.complete_authentication(pending).await,
            Err(AuthError::SubscriptionRequired("no seat".into()))
        );
        assert_eq!(handler.status().await, AuthState::Error(
            "An active Copilot subscription is required: no seat".into()
        ));
    }

    #[tokio::test]
    async fn login_with_token_skips_device_flow() {
        let handler = handler(TokenPollResponse::Denied, Ok(()));
        let token = handler.login_with_token("ghp_manual").await.expect("login");
        assert_eq!(token.token(), "ghp_manual-service");
        assert!(handler.status().await.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_first_exchange_wins() {
        let handler = Arc::new(slow_handler(
            TokenPollResponse::Success(PrimaryCredential::new("gho_user")),
            Ok(()),
            Duration::from_secs(10),
        ));
        let pending = handler.start_authentication().await.expect("device code");
        let login = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.complete_authentication(pending).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handler.cache().snapshot().await.refreshing);
        handler.logout().await;

        assert_eq!(login.await.expect("join"), Err(AuthError::Cancelled));
        assert_eq!(handler.status().await, AuthState::Unauthenticated);
        let snapshot = handler.cache().snapshot().await;
        assert!(!snapshot.has_credential);
        assert_eq!(snapshot.token_expires_at, None);
        assert_eq!(handler.cache().get().await, Err(AuthError::LoginRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_login_resets_pending_state() {
        let handler = Arc::new(handler(TokenPollResponse::Pending, Ok(())));
        let pending = handler.start_authentication().await.expect("device code");
        let polling = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.complete_authentication(pending).await })
        };
        tokio::time::sleep(Duration::from_secs(6)).await;

        handler.cancel_login().await;
        assert_eq!(polling.await.expect("join"), Err(AuthError::Cancelled));
        assert_eq!(handler.status().await, AuthState::Unauthenticated);
    }
}
