use std::fmt;

/// Login state as seen by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    PendingDeviceAuthorization,
    Authenticated,
    /// The last device code expired before it was approved.
    Expired,
    Denied,
    Error(String),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Unauthenticated => write!(f, "not logged in"),
            AuthState::PendingDeviceAuthorization => write!(f, "waiting for device authorization"),
            AuthState::Authenticated => write!(f, "logged in"),
            AuthState::Expired => write!(f, "device code expired, run login again"),
            AuthState::Denied => write!(f, "authorization denied, run login again"),
            AuthState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
