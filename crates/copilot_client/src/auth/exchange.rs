use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info, warn};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::token::{PrimaryCredential, ServiceToken};
use crate::error::{AuthError, ProtocolError};

const CONTEXT: &str = "copilot token";

/// Trades a primary credential for a scoped service token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, credential: &PrimaryCredential) -> Result<ServiceToken, AuthError>;
}

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: Option<String>,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    refresh_in: Option<u64>,
    chat_enabled: Option<bool>,
    endpoints: Option<Endpoints>,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    api: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    message: Option<String>,
    notification_id: Option<String>,
}

/// Exchange against `copilot_internal/v2/token`.
///
/// The client is expected to carry `RetryTransientMiddleware`, so transport
/// failures and 5xx answers are already retried with backoff when they
/// surface here as `AuthError::Network`.
#[derive(Debug, Clone)]
pub struct CopilotTokenExchanger {
    client: Arc<ClientWithMiddleware>,
    url: String,
}

impl CopilotTokenExchanger {
    pub fn new(client: Arc<ClientWithMiddleware>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenExchange for CopilotTokenExchanger {
    async fn exchange(&self, credential: &PrimaryCredential) -> Result<ServiceToken, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header("Authorization", format!("token {}", credential.token()))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        let token = parse_exchange_response(status, &body, Utc::now())?;
        info!(
            "Copilot token obtained, expires at {}",
            token.expires_at().to_rfc3339()
        );
        Ok(token)
    }
}

pub(crate) fn parse_exchange_response(
    status: StatusCode,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<ServiceToken, AuthError> {
    let text = || String::from_utf8_lossy(body).into_owned();

    match status {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => return Err(AuthError::ProxyAuthRequired),
        StatusCode::UNAUTHORIZED => return Err(AuthError::Unauthorized),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            if let Some(message) = subscription_message(body) {
                warn!("Copilot token refused: {message}");
                return Err(AuthError::SubscriptionRequired(message));
            }
            if status == StatusCode::FORBIDDEN {
                return Err(AuthError::Unauthorized);
            }
        }
        _ => {}
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AuthError::Network(format!(
            "Copilot token request failed: HTTP {status} - {}",
            text()
        )));
    }
    if !status.is_success() {
        let error_msg = format!("HTTP {status} - {}", text());
        error!("Failed to get copilot token: {error_msg}");
        return Err(ProtocolError::malformed(CONTEXT, error_msg).into());
    }

    let parsed: CopilotTokenResponse = serde_json::from_slice(body)
        .map_err(|e| ProtocolError::malformed(CONTEXT, format!("{e}: {}", text())))?;

    if parsed.chat_enabled == Some(false) {
        return Err(AuthError::SubscriptionRequired(
            "Copilot chat is not enabled for this account".to_string(),
        ));
    }

    let token = parsed
        .token
        .filter(|t| !t.is_empty())
        .ok_or(ProtocolError::MissingField {
            context: CONTEXT,
            field: "token",
        })?;

    let expires_at = match (parsed.expires_at, parsed.expires_in) {
        (Some(ts), _) => Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| ProtocolError::malformed(CONTEXT, format!("invalid expires_at {ts}")))?,
        (None, Some(secs)) => chrono::Duration::try_seconds(secs.max(0))
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| ProtocolError::malformed(CONTEXT, format!("invalid expires_in {secs}")))?,
        (None, None) => {
            // Treated as already near expiry: usable for the call that
            // triggered the exchange, refreshed on the next one.
            let drift = ProtocolError::MissingField {
                context: CONTEXT,
                field: "expires_at",
            };
            warn!("{drift}; forcing an early refresh");
            now
        }
    };

    Ok(ServiceToken::new(token, expires_at)
        .with_api_base(parsed.endpoints.and_then(|e| e.api))
        .with_refresh_in(parsed.refresh_in))
}

/// Message of a 403/404 body that signals a missing Copilot seat.
fn subscription_message(body: &[u8]) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    let details = parsed.error_details;
    let message = details
        .as_ref()
        .and_then(|d| d.message.clone())
        .or(parsed.message)
        .unwrap_or_default();

    let has_notification = details
        .as_ref()
        .and_then(|d| d.notification_id.as_deref())
        .is_some_and(|id| !id.is_empty());
    let lowered = message.to_ascii_lowercase();
    let mentions_seat = lowered.contains("subscription")
        || lowered.contains("copilot access")
        || lowered.contains("not have access to github copilot");

    if has_notification || mentions_seat {
        Some(if message.is_empty() {
            "No active Copilot subscription".to_string()
        } else {
            message
        })
    } else {
        None
    }
}
