use async_trait::async_trait;

use crate::api::models::{ApiResponse, RequestSpec};
use crate::auth::{AuthState, GithubUser, PendingLogin, ServiceToken};
use crate::error::{ApiError, AuthError};

/// Operations a front end (CLI, chat loop) needs from the Copilot client.
#[async_trait]
pub trait CopilotClientTrait: Send + Sync {
    /// Interactive device-flow login.
    async fn login(&self) -> Result<ServiceToken, AuthError>;

    async fn start_login(&self) -> Result<PendingLogin, AuthError>;

    /// Print the user code and, unless headless, open the verification page.
    fn present_login(&self, pending: &PendingLogin);

    async fn complete_login(&self, pending: PendingLogin) -> Result<ServiceToken, AuthError>;

    async fn cancel_login(&self);

    async fn login_with_token(&self, token: String) -> Result<ServiceToken, AuthError>;

    async fn status(&self) -> AuthState;

    /// GitHub account of the installed credential.
    async fn current_user(&self) -> Result<GithubUser, AuthError>;

    async fn logout(&self);

    async fn dispatch(&self, spec: RequestSpec) -> Result<ApiResponse, ApiError>;

    async fn list_models(&self) -> Result<Vec<String>, ApiError>;
}
