use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokio::time::Instant;

use super::token::PrimaryCredential;
use crate::error::{AuthError, ProtocolError};
use crate::masking::mask_secret;

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_EXPIRES_IN_SECS: u64 = 900;

/// One pending device authorization grant.
///
/// `expires_at` is on the tokio clock so the whole flow can be driven by a
/// paused runtime in tests.
#[derive(Clone)]
pub struct DeviceAuthorization {
    device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: Duration,
    pub expires_at: Instant,
    pub poll_interval: Duration,
}

impl DeviceAuthorization {
    /// Fails when `expires_in` puts the deadline past what the clock can represent.
    pub fn new(
        device_code: impl Into<String>,
        user_code: impl Into<String>,
        verification_uri: impl Into<String>,
        expires_in: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ProtocolError> {
        let expires_at = Instant::now().checked_add(expires_in).ok_or_else(|| {
            ProtocolError::malformed(
                "device code",
                format!("expires_in {}s is out of range", expires_in.as_secs()),
            )
        })?;
        Ok(Self {
            device_code: device_code.into(),
            user_code: user_code.into(),
            verification_uri: verification_uri.into(),
            expires_in,
            expires_at,
            poll_interval,
        })
    }

    pub(crate) fn device_code(&self) -> &str {
        &self.device_code
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("device_code", &mask_secret(&self.device_code))
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("expires_in", &self.expires_in)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: Option<String>,
    user_code: Option<String>,
    verification_uri: Option<String>,
    expires_in: Option<u64>,
    interval: Option<u64>,
}

impl DeviceCodeResponse {
    fn into_authorization(self) -> Result<DeviceAuthorization, ProtocolError> {
        const CONTEXT: &str = "device code";
        let missing = |field| ProtocolError::MissingField {
            context: CONTEXT,
            field,
        };
        let device_code = self.device_code.ok_or_else(|| missing("device_code"))?;
        let user_code = self.user_code.ok_or_else(|| missing("user_code"))?;
        let verification_uri = self
            .verification_uri
            .ok_or_else(|| missing("verification_uri"))?;
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        if expires_in == 0 {
            return Err(ProtocolError::malformed(CONTEXT, "expires_in must be positive"));
        }
        let interval = self.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS).max(1);

        DeviceAuthorization::new(
            device_code,
            user_code,
            verification_uri,
            Duration::from_secs(expires_in),
            Duration::from_secs(interval),
        )
    }
}

/// Answer of the token-poll endpoint, parsed into a closed set at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPollResponse {
    Success(PrimaryCredential),
    Pending,
    /// `interval` is the provider's new polling interval, when it sends one.
    SlowDown { interval: Option<Duration> },
    Denied,
    Expired,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

impl TokenPollResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        const CONTEXT: &str = "access token";
        let response: AccessTokenResponse = serde_json::from_slice(body)
            .map_err(|e| {
                ProtocolError::malformed(
                    CONTEXT,
                    format!("{e}: {}", String::from_utf8_lossy(body)),
                )
            })?;

        if let Some(token) = response.access_token.filter(|t| !t.is_empty()) {
            return Ok(TokenPollResponse::Success(PrimaryCredential::new(token)));
        }

        match response.error.as_deref() {
            Some("authorization_pending") => Ok(TokenPollResponse::Pending),
            Some("slow_down") => Ok(TokenPollResponse::SlowDown {
                interval: response.interval.map(Duration::from_secs),
            }),
            Some("access_denied") => Ok(TokenPollResponse::Denied),
            Some("expired_token") => Ok(TokenPollResponse::Expired),
            Some(code) => Err(ProtocolError::UnexpectedProviderError {
                code: code.to_string(),
                description: response.error_description.unwrap_or_default(),
            }),
            None => Err(ProtocolError::MissingField {
                context: CONTEXT,
                field: "access_token",
            }),
        }
    }
}

/// Identity-provider side of the device flow.
#[async_trait]
pub trait DeviceFlowApi: Send + Sync {
    /// Ask for a new device authorization grant. Never retried here: a new
    /// grant means a new user code that has to be shown again.
    async fn request_device_authorization(
        &self,
        client_id: &str,
        scopes: &[String],
    ) -> Result<DeviceAuthorization, AuthError>;

    async fn poll_token(
        &self,
        client_id: &str,
        device_code: &str,
    ) -> Result<TokenPollResponse, AuthError>;
}

/// GitHub's device flow endpoints.
#[derive(Debug, Clone)]
pub struct GithubDeviceFlow {
    client: Arc<ClientWithMiddleware>,
    device_code_url: String,
    access_token_url: String,
}

impl GithubDeviceFlow {
    pub fn new(
        client: Arc<ClientWithMiddleware>,
        device_code_url: impl Into<String>,
        access_token_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            device_code_url: device_code_url.into(),
            access_token_url: access_token_url.into(),
        }
    }
}

#[async_trait]
impl DeviceFlowApi for GithubDeviceFlow {
    async fn request_device_authorization(
        &self,
        client_id: &str,
        scopes: &[String],
    ) -> Result<DeviceAuthorization, AuthError> {
        let scope = scopes.join(" ");
        let params = [("client_id", client_id), ("scope", scope.as_str())];

        let response = self
            .client
            .post(&self.device_code_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(AuthError::ProxyAuthRequired);
        }
        let body = response.bytes().await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            if status.is_server_error() {
                return Err(AuthError::Network(format!(
                    "Device code request failed: HTTP {status} - {text}"
                )));
            }
            return Err(ProtocolError::malformed("device code", format!("HTTP {status} - {text}")).into());
        }

        let parsed: DeviceCodeResponse = serde_json::from_slice(&body).map_err(|e| {
            ProtocolError::malformed(
                "device code",
                format!("{e}: {}", String::from_utf8_lossy(&body)),
            )
        })?;
        let device = parsed.into_authorization()?;
        info!(
            "Device code issued, expires in {}s, polling every {}s",
            device.expires_in.as_secs(),
            device.poll_interval.as_secs()
        );
        Ok(device)
    }

    async fn poll_token(
        &self,
        client_id: &str,
        device_code: &str,
    ) -> Result<TokenPollResponse, AuthError> {
        let params = [
            ("client_id", client_id),
            ("device_code", device_code),
            ("grant_type", DEVICE_GRANT_TYPE),
        ];

        let response = self
            .client
            .post(&self.access_token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(AuthError::ProxyAuthRequired);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::Network(format!("Token poll failed: HTTP {status}")));
        }
        // RFC 8628 providers answer pending/denied with 400; GitHub uses 200.
        let body = response.bytes().await?;
        let parsed = TokenPollResponse::parse(&body)?;
        debug!("Token poll answered {:?}", PollKind::from(&parsed));
        Ok(parsed)
    }
}

/// Credential-free view of a poll answer for logging.
#[derive(Debug)]
enum PollKind {
    Success,
    Pending,
    SlowDown,
    Denied,
    Expired,
}

impl From<&TokenPollResponse> for PollKind {
    fn from(response: &TokenPollResponse) -> Self {
        match response {
            TokenPollResponse::Success(_) => PollKind::Success,
            TokenPollResponse::Pending => PollKind::Pending,
            TokenPollResponse::SlowDown { .. } => PollKind::SlowDown,
            TokenPollResponse::Denied => PollKind::Denied,
            TokenPollResponse::Expired => PollKind::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCodePresentation {
    Headless(String),
    Browser(String),
}

pub fn device_code_presentation(
    device: &DeviceAuthorization,
    headless: bool,
) -> DeviceCodePresentation {
    let message = format!(
        "GitHub Device Authorization\nVerification URL: {}\nUser Code: {}\nExpires in {} seconds\n",
        device.verification_uri,
        device.user_code,
        device.expires_in.as_secs()
    );
    if headless {
        DeviceCodePresentation::Headless(message)
    } else {
        DeviceCodePresentation::Browser(message)
    }
}

/// Show the user code; outside headless mode also open the verification page.
pub fn present_device_code(device: &DeviceAuthorization, headless: bool) {
    match device_code_presentation(device, headless) {
        DeviceCodePresentation::Headless(message) => {
            println!("{message}");
        }
        DeviceCodePresentation::Browser(message) => {
            println!("{message}");
            if let Err(e) = webbrowser::open(&device.verification_uri) {
                warn!("Could not open browser automatically: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_poll_answers() {
        let pending = TokenPollResponse::parse(br#"{"error":"authorization_pending"}"#);
        assert_eq!(pending, Ok(TokenPollResponse::Pending));

        let slow = TokenPollResponse::parse(br#"{"error":"slow_down","interval":10}"#);
        assert_eq!(
            slow,
            Ok(TokenPollResponse::SlowDown {
                interval: Some(Duration::from_secs(10))
            })
        );

        let denied = TokenPollResponse::parse(br#"{"error":"access_denied"}"#);
        assert_eq!(denied, Ok(TokenPollResponse::Denied));

        let expired = TokenPollResponse::parse(br#"{"error":"expired_token"}"#);
        assert_eq!(expired, Ok(TokenPollResponse::Expired));

        let success =
            TokenPollResponse::parse(br#"{"access_token":"gho_x","token_type":"bearer"}"#);
        assert!(matches!(
            success,
            Ok(TokenPollResponse::Success(ref c)) if c.token() == "gho_x"
        ));
    }

    #[test]
    fn unknown_poll_error_is_protocol_error() {
        let result = TokenPollResponse::parse(
            br#"{"error":"unsupported_grant_type","error_description":"bad grant"}"#,
        );
        assert_eq!(
            result,
            Err(ProtocolError::UnexpectedProviderError {
                code: "unsupported_grant_type".into(),
                description: "bad grant".into(),
            })
        );
        assert!(matches!(
            TokenPollResponse::parse(b"<html>"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            TokenPollResponse::parse(b"{}"),
            Err(ProtocolError::MissingField { field: "access_token", .. })
        ));
    }

    #[tokio::test]
    async fn device_code_response_defaults_and_required_fields() {
        let response: DeviceCodeResponse = serde_json::from_str(
            r#"{"device_code":"d","user_code":"ABCD-EFGH","verification_uri":"https://github.com/login/device"}"#,
        )
        .expect("json");
        let device = response.into_authorization().expect("device");
        assert_eq!(device.poll_interval, Duration::from_secs(5));
        assert_eq!(device.expires_in, Duration::from_secs(900));

        let response: DeviceCodeResponse =
            serde_json::from_str(r#"{"device_code":"d","verification_uri":"u"}"#).expect("json");
        assert_eq!(
            response.into_authorization().unwrap_err(),
            ProtocolError::MissingField {
                context: "device code",
                field: "user_code"
            }
        );
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_protocol_error() {
        let response: DeviceCodeResponse = serde_json::from_str(&format!(
            r#"{{"device_code":"d","user_code":"ABCD-EFGH","verification_uri":"u","expires_in":{}}}"#,
            u64::MAX
        ))
        .expect("json");
        assert!(matches!(
            response.into_authorization(),
            Err(ProtocolError::Malformed { .. })
        ));

        let response: DeviceCodeResponse = serde_json::from_str(
            r#"{"device_code":"d","user_code":"ABCD-EFGH","verification_uri":"u","expires_in":0}"#,
        )
        .expect("json");
        assert!(response.into_authorization().is_err());
    }

    #[tokio::test]
    async fn device_code_presentation_respects_headless_flag() {
        let device = DeviceAuthorization::new(
            "device",
            "ABCD-EFGH",
            "https://github.com/login/device",
            Duration::from_secs(900),
            Duration::from_secs(5),
        )
        .expect("device");

        assert!(matches!(
            device_code_presentation(&device, true),
            DeviceCodePresentation::Headless(message)
                if message.contains(&device.verification_uri)
                    && message.contains(&device.user_code)
        ));
        assert!(matches!(
            device_code_presentation(&device, false),
            DeviceCodePresentation::Browser(_)
        ));
        assert!(!format!("{device:?}").contains("\"device\""));
    }
}
