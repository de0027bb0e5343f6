use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::config::RetryConfig;

/// How the dispatcher reacts to a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Unauthorized,
    ProxyAuthRequired,
    RateLimited,
    ServerError,
    Rejected,
}

pub fn classify(status: StatusCode) -> ResponseClass {
    match status {
        s if s.is_success() => ResponseClass::Success,
        StatusCode::UNAUTHORIZED => ResponseClass::Unauthorized,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ResponseClass::ProxyAuthRequired,
        StatusCode::TOO_MANY_REQUESTS => ResponseClass::RateLimited,
        s if s.is_server_error() => ResponseClass::ServerError,
        _ => ResponseClass::Rejected,
    }
}

/// Exponential backoff: `base * 2^(attempt-1)` capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_retry_after: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_retry_after: config.max_retry_after(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// A `Retry-After` value wins over the computed delay, clamped to `max_retry_after`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(self.max_retry_after);
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((date - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn backoff() -> Backoff {
        Backoff::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            max_retry_after_secs: 60,
        })
    }

    #[test]
    fn classify_statuses() {
        assert_eq!(classify(StatusCode::OK), ResponseClass::Success);
        assert_eq!(classify(StatusCode::CREATED), ResponseClass::Success);
        assert_eq!(classify(StatusCode::UNAUTHORIZED), ResponseClass::Unauthorized);
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS), ResponseClass::RateLimited);
        assert_eq!(classify(StatusCode::BAD_GATEWAY), ResponseClass::ServerError);
        assert_eq!(classify(StatusCode::BAD_REQUEST), ResponseClass::Rejected);
        assert_eq!(classify(StatusCode::FORBIDDEN), ResponseClass::Rejected);
        assert_eq!(
            classify(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            ResponseClass::ProxyAuthRequired
        );
    }

    #[test]
    fn delay_doubles_and_caps() {
        let backoff = backoff();
        let secs: Vec<u64> = (1..=5).map(|n| backoff.delay(n, None).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.delay(100, None), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_wins_and_is_clamped() {
        let backoff = backoff();
        assert_eq!(
            backoff.delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.delay(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn exhaustion_counts_total_attempts() {
        let backoff = backoff();
        assert!(!backoff.exhausted(4));
        assert!(backoff.exhausted(5));
    }

    #[test]
    fn retry_after_formats() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, now), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(2)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(60)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }
}
