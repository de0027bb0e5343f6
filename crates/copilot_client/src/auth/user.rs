use std::sync::Arc;

use log::{debug, error};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use super::token::PrimaryCredential;
use crate::error::{AuthError, ProtocolError};

const CONTEXT: &str = "github user";

/// The GitHub account behind the primary credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl GithubUser {
    /// `name (login)`, or just the login when the profile has no name.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{name} ({})", self.login),
            None => self.login.clone(),
        }
    }
}

/// Looks up the account a primary credential belongs to.
#[derive(Debug, Clone)]
pub struct GithubUserLookup {
    client: Arc<ClientWithMiddleware>,
    url: String,
}

impl GithubUserLookup {
    pub fn new(client: Arc<ClientWithMiddleware>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub async fn fetch(&self, credential: &PrimaryCredential) -> Result<GithubUser, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header("Authorization", format!("token {}", credential.token()))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        let user = parse_user_response(status, &body)?;
        debug!("Primary credential belongs to {}", user.login);
        Ok(user)
    }
}

fn parse_user_response(status: StatusCode, body: &[u8]) -> Result<GithubUser, AuthError> {
    let text = || String::from_utf8_lossy(body).into_owned();

    match status {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => return Err(AuthError::ProxyAuthRequired),
        StatusCode::UNAUTHORIZED => return Err(AuthError::Unauthorized),
        _ => {}
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AuthError::Network(format!(
            "User lookup failed: HTTP {status} - {}",
            text()
        )));
    }
    if !status.is_success() {
        let error_msg = format!("HTTP {status} - {}", text());
        error!("Failed to look up GitHub user: {error_msg}");
        return Err(ProtocolError::malformed(CONTEXT, error_msg).into());
    }

    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::malformed(CONTEXT, format!("{e}: {}", text())).into())
}
