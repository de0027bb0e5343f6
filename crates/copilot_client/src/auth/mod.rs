//! Copilot Authentication Module
//!
//! Device Code Flow:
//! 1. Get device code from github.com/login/device/code
//! 2. User authorizes at github.com/login/device
//! 3. Poll for access token
//! 4. Exchange for copilot token
//! 5. Cache in memory and refresh on expiry
//!
//! `GET /user` with the same credential tells who is logged in.

pub mod auth_handler;
pub mod cache;
pub mod device_code;
pub mod exchange;
pub mod poller;
pub mod state;
pub mod token;
pub mod user;

pub use auth_handler::{CopilotAuthHandler, PendingLogin};
pub use cache::{CacheSnapshot, TokenCache};
pub use device_code::{
    present_device_code, DeviceAuthorization, DeviceCodePresentation, DeviceFlowApi,
    GithubDeviceFlow, TokenPollResponse,
};
pub use exchange::{CopilotTokenExchanger, TokenExchange};
pub use poller::{AuthorizationPoller, PollOutcome};
pub use state::AuthState;
pub use token::{PrimaryCredential, ServiceToken};
pub use user::{GithubUser, GithubUserLookup};
