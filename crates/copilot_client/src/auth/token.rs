use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::masking::mask_secret;

/// The GitHub access token obtained from the device flow.
///
/// Kept in memory only; `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryCredential {
    token: String,
    obtained_at: DateTime<Utc>,
}

impl PrimaryCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            obtained_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }
}

impl fmt::Debug for PrimaryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryCredential")
            .field("token", &mask_secret(&self.token))
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Short-lived Copilot token used as the bearer credential for API calls.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceToken {
    token: String,
    expires_at: DateTime<Utc>,
    refresh_count: u32,
    api_base: Option<String>,
    refresh_in: Option<u64>,
}

impl ServiceToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            refresh_count: 0,
            api_base: None,
            refresh_in: None,
        }
    }

    pub(crate) fn with_api_base(mut self, api_base: Option<String>) -> Self {
        self.api_base = api_base;
        self
    }

    pub(crate) fn with_refresh_in(mut self, refresh_in: Option<u64>) -> Self {
        self.refresh_in = refresh_in;
        self
    }

    pub(crate) fn with_refresh_count(mut self, refresh_count: u32) -> Self {
        self.refresh_count = refresh_count;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Number of exchanges performed in this process, this one included.
    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }

    /// API base advertised by the token endpoint (`endpoints.api`).
    pub fn api_base(&self) -> Option<&str> {
        self.api_base.as_deref()
    }

    pub fn refresh_in(&self) -> Option<u64> {
        self.refresh_in
    }

    /// Valid only while `expires_at` is strictly after `now + margin`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(threshold) => self.expires_at > threshold,
            None => false,
        }
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceToken")
            .field("token", &mask_secret(&self.token))
            .field("expires_at", &self.expires_at)
            .field("refresh_count", &self.refresh_count)
            .field("api_base", &self.api_base)
            .finish()
    }
}
