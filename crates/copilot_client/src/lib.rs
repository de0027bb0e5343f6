pub mod api;
pub mod auth;
pub mod client_trait;
pub mod config;
pub mod error;
pub mod masking;
pub mod utils;

pub use api::client::CopilotClient;
pub use api::models::{ApiResponse, RequestSpec};
pub use auth::{AuthState, GithubUser, PendingLogin, ServiceToken};
pub use client_trait::CopilotClientTrait;
pub use config::Config;
pub use error::{ApiError, AuthError, ConfigError, ProtocolError};
pub use masking::mask_secret;
