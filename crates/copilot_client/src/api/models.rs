use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ProtocolError;

/// A call to the Copilot API, relative to the API base.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful response, fully buffered.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
    pub interaction_id: String,
    /// Calls issued for this dispatch, the successful one included.
    pub attempts: u32,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ProtocolError::malformed("api", format!("{e}: {}", String::from_utf8_lossy(&self.body)))
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorPayload>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Detailed { message: Option<String> },
    Text(String),
}

/// Best human-readable message from an error body.
pub(crate) fn provider_message(body: &[u8]) -> String {
    let raw = || String::from_utf8_lossy(body).trim().to_string();
    let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) else {
        return raw();
    };
    match envelope.error {
        Some(ErrorPayload::Detailed { message: Some(message) }) => message,
        Some(ErrorPayload::Text(message)) => message,
        _ => envelope.message.unwrap_or_else(raw),
    }
}
