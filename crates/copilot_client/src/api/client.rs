use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use reqwest::Url;

use crate::api::dispatcher::RequestDispatcher;
use crate::api::models::{ApiResponse, RequestSpec};
use crate::api::retry::Backoff;
use crate::auth::{
    present_device_code, AuthState, CopilotAuthHandler, CopilotTokenExchanger, GithubDeviceFlow,
    GithubUser, GithubUserLookup, PendingLogin, ServiceToken, TokenCache,
};
use crate::client_trait::CopilotClientTrait;
use crate::config::Config;
use crate::error::{ApiError, AuthError, ConfigError};
use crate::utils::http_utils::{build_http_client, build_plain_client, build_retry_client};

use super::models_handler::CopilotModelsHandler;

/// Login, token upkeep and request dispatch behind one handle.
pub struct CopilotClient {
    auth_handler: CopilotAuthHandler,
    user_lookup: GithubUserLookup,
    dispatcher: Arc<RequestDispatcher>,
    models_handler: CopilotModelsHandler,
    headless_auth: bool,
}

impl CopilotClient {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        if let Some(api_base) = &config.api_base {
            Url::parse(api_base).map_err(|e| ConfigError(format!("api_base {api_base}: {e}")))?;
        }

        let http = build_http_client(&config)?;
        // Device-flow polls and API calls decide their own retries; only the
        // token exchange goes through the retry middleware.
        let plain_client = Arc::new(build_plain_client(http.clone()));
        let retry_client = Arc::new(build_retry_client(http));

        let user_lookup = GithubUserLookup::new(Arc::clone(&plain_client), config.user_url.clone());
        let device_flow = Arc::new(GithubDeviceFlow::new(
            Arc::clone(&plain_client),
            config.device_code_url.clone(),
            config.access_token_url.clone(),
        ));
        let exchanger = Arc::new(CopilotTokenExchanger::new(
            retry_client,
            config.copilot_token_url.clone(),
        ));
        let cache = Arc::new(TokenCache::new(exchanger, config.token_safety_margin()));

        let auth_handler = CopilotAuthHandler::new(
            device_flow,
            Arc::clone(&cache),
            config.client_id.clone(),
            config.scopes.clone(),
            config.headless_auth,
        );
        let dispatcher = Arc::new(RequestDispatcher::new(
            plain_client,
            cache,
            config.api_base.clone(),
            config.api_version.clone(),
            Backoff::new(&config.retry),
        ));
        let models_handler = CopilotModelsHandler::new(Arc::clone(&dispatcher));

        info!(
            "Copilot client ready (client id {}, headless: {})",
            config.client_id, config.headless_auth
        );
        Ok(CopilotClient {
            auth_handler,
            user_lookup,
            dispatcher,
            models_handler,
            headless_auth: config.headless_auth,
        })
    }
}

#[async_trait]
impl CopilotClientTrait for CopilotClient {
    async fn login(&self) -> Result<ServiceToken, AuthError> {
        self.auth_handler.login().await
    }

    async fn start_login(&self) -> Result<PendingLogin, AuthError> {
        self.auth_handler.start_authentication().await
    }

    fn present_login(&self, pending: &PendingLogin) {
        present_device_code(&pending.device, self.headless_auth);
    }

    async fn complete_login(&self, pending: PendingLogin) -> Result<ServiceToken, AuthError> {
        self.auth_handler.complete_authentication(pending).await
    }

    async fn cancel_login(&self) {
        self.auth_handler.cancel_login().await;
    }

    async fn login_with_token(&self, token: String) -> Result<ServiceToken, AuthError> {
        self.auth_handler.login_with_token(token).await
    }

    async fn status(&self) -> AuthState {
        self.auth_handler.status().await
    }

    async fn current_user(&self) -> Result<GithubUser, AuthError> {
        let credential = self
            .auth_handler
            .cache()
            .credential()
            .await
            .ok_or(AuthError::LoginRequired)?;
        self.user_lookup.fetch(&credential).await
    }

    async fn logout(&self) {
        self.auth_handler.logout().await;
        self.models_handler.forget().await;
    }

    async fn dispatch(&self, spec: RequestSpec) -> Result<ApiResponse, ApiError> {
        self.dispatcher.send(&spec).await
    }

    async fn list_models(&self) -> Result<Vec<String>, ApiError> {
        self.models_handler.get_models().await
    }
}
