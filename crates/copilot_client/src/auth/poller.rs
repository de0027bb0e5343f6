use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::device_code::{DeviceAuthorization, DeviceFlowApi, TokenPollResponse};
use super::token::PrimaryCredential;
use crate::error::AuthError;

/// Interval increase applied on `slow_down` when the provider gives no new value.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Terminal states of one polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success(PrimaryCredential),
    Denied,
    Expired,
    Cancelled,
}

impl PollOutcome {
    pub fn into_result(self) -> Result<PrimaryCredential, AuthError> {
        match self {
            PollOutcome::Success(credential) => Ok(credential),
            PollOutcome::Denied => Err(AuthError::Denied),
            PollOutcome::Expired => Err(AuthError::DeviceCodeExpired),
            PollOutcome::Cancelled => Err(AuthError::Cancelled),
        }
    }
}

/// Polls the token endpoint until the grant is approved, denied, expired or cancelled.
pub struct AuthorizationPoller {
    api: Arc<dyn DeviceFlowApi>,
    client_id: String,
    max_consecutive_failures: u32,
}

impl AuthorizationPoller {
    pub fn new(api: Arc<dyn DeviceFlowApi>, client_id: impl Into<String>) -> Self {
        Self {
            api,
            client_id: client_id.into(),
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }

    /// First poll is immediate; later polls wait `poll_interval`, never past `expires_at`.
    ///
    /// Transport failures are retried on the next tick until more than
    /// `max_consecutive_failures` happen in a row. Protocol errors end the
    /// loop immediately.
    pub async fn poll(
        &self,
        mut device: DeviceAuthorization,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, AuthError> {
        let deadline = device.expires_at;
        let mut failures = 0u32;
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("Device authorization cancelled after {polls} polls");
                return Ok(PollOutcome::Cancelled);
            }
            if device.is_expired() {
                info!("Device code expired after {polls} polls");
                return Ok(PollOutcome::Expired);
            }

            polls += 1;
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Device authorization cancelled during poll {polls}");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    info!("Device code expired during poll {polls}");
                    return Ok(PollOutcome::Expired);
                }
                response = self.api.poll_token(&self.client_id, device.device_code()) => response,
            };

            match response {
                Ok(TokenPollResponse::Success(credential)) => {
                    info!("Device authorization approved after {polls} polls");
                    return Ok(PollOutcome::Success(credential));
                }
                Ok(TokenPollResponse::Pending) => {
                    failures = 0;
                    debug!("Authorization pending, next poll in {:?}", device.poll_interval);
                }
                Ok(TokenPollResponse::SlowDown { interval }) => {
                    failures = 0;
                    device.poll_interval = slowed_interval(device.poll_interval, interval);
                    warn!(
                        "Provider asked to slow down, polling every {:?}",
                        device.poll_interval
                    );
                }
                Ok(TokenPollResponse::Denied) => {
                    info!("Device authorization denied by user");
                    return Ok(PollOutcome::Denied);
                }
                Ok(TokenPollResponse::Expired) => {
                    info!("Provider reported the device code as expired");
                    return Ok(PollOutcome::Expired);
                }
                Err(AuthError::Network(message)) => {
                    failures += 1;
                    if failures > self.max_consecutive_failures {
                        return Err(AuthError::Network(message));
                    }
                    warn!("Token poll failed ({failures} in a row): {message}");
                }
                Err(e) => return Err(e),
            }

            let wake_at = Instant::now()
                .checked_add(device.poll_interval)
                .map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Device authorization cancelled while waiting");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = sleep_until(wake_at) => {}
            }
        }
    }
}

fn slowed_interval(current: Duration, provider: Option<Duration>) -> Duration {
    match provider {
        Some(interval) if interval > current => interval,
        _ => current.saturating_add(SLOW_DOWN_STEP),
    }
}
