use std::time::Duration;

use thiserror::Error;

/// A provider response that does not match the documented contract.
///
/// Never retried: the raw detail is kept so a contract drift with the
/// provider can be diagnosed from the surfaced error alone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing required field '{field}' in {context} response")]
    MissingField { context: &'static str, field: &'static str },

    #[error("Invalid {context} response: {detail}")]
    Malformed { context: &'static str, detail: String },

    #[error("Unexpected provider error '{code}': {description}")]
    UnexpectedProviderError { code: String, description: String },
}

impl ProtocolError {
    pub(crate) fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        let mut detail = detail.into();
        if detail.len() > 512 {
            let mut cut = 512;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
            detail.push_str("...");
        }
        ProtocolError::Malformed { context, detail }
    }
}

/// Failures of the login and token lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authorization was denied by the user")]
    Denied,

    #[error("The device code expired before authorization completed")]
    DeviceCodeExpired,

    #[error("Login was cancelled")]
    Cancelled,

    #[error("Credential is invalid or revoked")]
    Unauthorized,

    #[error("An active Copilot subscription is required: {0}")]
    SubscriptionRequired(String),

    #[error("Not logged in")]
    LoginRequired,

    #[error("proxy_auth_required")]
    ProxyAuthRequired,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }

    /// Whether the user has to go through the device flow again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::Denied
                | AuthError::DeviceCodeExpired
                | AuthError::Unauthorized
                | AuthError::LoginRequired
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

impl From<reqwest_middleware::Error> for AuthError {
    fn from(e: reqwest_middleware::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

/// The client could not be built from its configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid client configuration: {0}")]
pub struct ConfigError(pub String);

impl From<reqwest::Error> for ConfigError {
    fn from(e: reqwest::Error) -> Self {
        ConfigError(e.to_string())
    }
}

/// Failures surfaced by the request dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Server error (HTTP {status}) after {attempts} attempts: {message}")]
    ServerError {
        status: u16,
        attempts: u32,
        message: String,
    },

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } | ApiError::ServerError { .. } | ApiError::Network { .. } => {
                true
            }
            ApiError::Auth(e) => e.is_retryable(),
            ApiError::Rejected { .. } | ApiError::Protocol(_) => false,
        }
    }
}
