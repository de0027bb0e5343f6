use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
pub const DEFAULT_API_BASE: &str = "https://api.githubcopilot.com";
pub const DEFAULT_API_VERSION: &str = "2025-04-01";

const CONFIG_FILE_PATH: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub device_code_url: String,
    pub access_token_url: String,
    pub copilot_token_url: String,
    pub user_url: String,
    pub api_base: Option<String>,
    pub api_version: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub http_proxy_auth: Option<ProxyAuth>,
    pub https_proxy_auth: Option<ProxyAuth>,
    pub headless_auth: bool,
    pub request_timeout_secs: u64,
    pub token_safety_margin_secs: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Backoff bounds for 429/5xx/transport retries in the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retry_after_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retry_after_secs: 120,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scopes: vec!["read:user".to_string()],
            device_code_url: "https://github.com/login/device/code".to_string(),
            access_token_url: "https://github.com/login/oauth/access_token".to_string(),
            copilot_token_url: "https://api.github.com/copilot_internal/v2/token".to_string(),
            user_url: "https://api.github.com/user".to_string(),
            api_base: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            http_proxy: String::new(),
            https_proxy: String::new(),
            http_proxy_auth: None,
            https_proxy_auth: None,
            headless_auth: false,
            request_timeout_secs: 30,
            token_safety_margin_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then `config.toml` in the working directory, then environment overrides.
    pub fn load() -> Self {
        Self::load_from(CONFIG_FILE_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut config = Config::default();

        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<Config>(&content) {
                    Ok(file_config) => config = file_config,
                    Err(e) => log::warn!("Ignoring invalid config file {:?}: {}", path, e),
                },
                Err(e) => log::warn!("Could not read config file {:?}: {}", path, e),
            }
        }

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(http_proxy) = std::env::var("HTTP_PROXY") {
            self.http_proxy = http_proxy;
        }
        if let Ok(https_proxy) = std::env::var("HTTPS_PROXY") {
            self.https_proxy = https_proxy;
        }
        if let Ok(api_base) = std::env::var("API_BASE") {
            self.api_base = Some(api_base);
        }
        if let Ok(client_id) = std::env::var("COPILOT_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Ok(headless) = std::env::var("COPILOT_CHAT_HEADLESS") {
            self.headless_auth = parse_bool_env(&headless);
        }
        if let Ok(timeout) = std::env::var("COPILOT_REQUEST_TIMEOUT_SECS") {
            match timeout.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.request_timeout_secs = secs,
                _ => log::warn!("Ignoring invalid COPILOT_REQUEST_TIMEOUT_SECS={timeout:?}"),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }
}
