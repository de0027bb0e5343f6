use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use uuid::Uuid;

use super::models::{provider_message, ApiResponse, RequestSpec};
use super::retry::{classify, parse_retry_after, Backoff, ResponseClass};
use crate::auth::{ServiceToken, TokenCache};
use crate::config::DEFAULT_API_BASE;
use crate::error::{ApiError, AuthError, ProtocolError};
use crate::utils::http_utils::execute_request;

/// Sends API calls with a valid service token, correlation ids and bounded retries.
pub struct RequestDispatcher {
    client: Arc<ClientWithMiddleware>,
    cache: Arc<TokenCache>,
    api_base: Option<String>,
    api_version: String,
    backoff: Backoff,
}

enum Outcome {
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Transport(String),
}

impl RequestDispatcher {
    pub fn new(
        client: Arc<ClientWithMiddleware>,
        cache: Arc<TokenCache>,
        api_base: Option<String>,
        api_version: impl Into<String>,
        backoff: Backoff,
    ) -> Self {
        Self {
            client,
            cache,
            api_base,
            api_version: api_version.into(),
            backoff,
        }
    }

    pub async fn send(&self, spec: &RequestSpec) -> Result<ApiResponse, ApiError> {
        let mut calls = 0u32;
        // 429/5xx/transport failures; a 401 retry is not counted here.
        let mut failures = 0u32;
        let mut refreshed_after_401 = false;

        loop {
            let token = self.cache.get().await?;
            let url = self.url_for(&token, &spec.path)?;
            let request_id = Uuid::new_v4().to_string();
            let interaction_id = Uuid::new_v4().to_string();
            let headers = self.headers_for(spec, &token, &request_id, &interaction_id)?;

            calls += 1;
            debug!(
                "Dispatch {} {} (call #{calls}, request id {request_id})",
                spec.method, spec.path
            );
            let outcome = match execute_request(
                &self.client,
                spec.method.clone(),
                url,
                headers,
                spec.body.as_ref(),
            )
            .await
            {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    match response.bytes().await {
                        Ok(body) => Outcome::Response {
                            status,
                            headers,
                            body,
                        },
                        Err(e) => Outcome::Transport(e.to_string()),
                    }
                }
                Err(e) => Outcome::Transport(e.to_string()),
            };

            let (status, headers, body) = match outcome {
                Outcome::Response {
                    status,
                    headers,
                    body,
                } => (status, headers, body),
                Outcome::Transport(message) => {
                    failures += 1;
                    if self.backoff.exhausted(failures) {
                        return Err(ApiError::Network {
                            attempts: calls,
                            message,
                        });
                    }
                    let delay = self.backoff.delay(failures, None);
                    warn!("Transport failure on {}: {message}; retrying in {delay:?}", spec.path);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match classify(status) {
                ResponseClass::Success => {
                    return Ok(ApiResponse {
                        status,
                        headers,
                        body,
                        request_id,
                        interaction_id,
                        attempts: calls,
                    });
                }
                ResponseClass::Unauthorized => {
                    if refreshed_after_401 {
                        warn!("Still unauthorized after refreshing the service token");
                        return Err(AuthError::Unauthorized.into());
                    }
                    info!("Service token rejected, forcing a refresh");
                    refreshed_after_401 = true;
                    self.cache.invalidate(&token).await;
                }
                ResponseClass::ProxyAuthRequired => {
                    return Err(AuthError::ProxyAuthRequired.into());
                }
                ResponseClass::RateLimited => {
                    failures += 1;
                    let retry_after = parse_retry_after(&headers, Utc::now());
                    if self.backoff.exhausted(failures) {
                        return Err(ApiError::RateLimited {
                            attempts: calls,
                            retry_after,
                        });
                    }
                    let delay = self.backoff.delay(failures, retry_after);
                    warn!("Rate limited on {}; retrying in {delay:?}", spec.path);
                    tokio::time::sleep(delay).await;
                }
                ResponseClass::ServerError => {
                    failures += 1;
                    if self.backoff.exhausted(failures) {
                        return Err(ApiError::ServerError {
                            status: status.as_u16(),
                            attempts: calls,
                            message: provider_message(&body),
                        });
                    }
                    let delay = self.backoff.delay(failures, parse_retry_after(&headers, Utc::now()));
                    warn!("HTTP {status} on {}; retrying in {delay:?}", spec.path);
                    tokio::time::sleep(delay).await;
                }
                ResponseClass::Rejected => {
                    return Err(ApiError::Rejected {
                        status: status.as_u16(),
                        message: provider_message(&body),
                    });
                }
            }
        }
    }

    /// Configured base, then the base advertised with the token, then the public default.
    fn url_for(&self, token: &ServiceToken, path: &str) -> Result<Url, ProtocolError> {
        let base = self
            .api_base
            .as_deref()
            .or_else(|| token.api_base())
            .unwrap_or(DEFAULT_API_BASE);
        join_url(base, path)
    }

    fn headers_for(
        &self,
        spec: &RequestSpec,
        token: &ServiceToken,
        request_id: &str,
        interaction_id: &str,
    ) -> Result<HeaderMap, ProtocolError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProtocolError::malformed("request", format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProtocolError::malformed("request", format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.token()))
            .map_err(|_| ProtocolError::malformed("token", "service token is not a valid header"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("x-request-id", header_value(request_id)?);
        headers.insert("x-interaction-id", header_value(interaction_id)?);
        headers.insert("x-github-api-version", header_value(&self.api_version)?);
        headers.insert("openai-intent", HeaderValue::from_static("conversation-panel"));
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(value)
        .map_err(|e| ProtocolError::malformed("request", format!("{value}: {e}")))
}

fn join_url(base: &str, path: &str) -> Result<Url, ProtocolError> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| ProtocolError::malformed("request", format!("{joined}: {e}")))
}
