use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong during a poll cycle.
///
/// None of these are fatal: the polling loop records them in the session log,
/// reflects them in the badge, and retries on the next cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("no credential observed yet")]
    NoCredential,

    #[error("authentication rejected (401): {detail}")]
    Auth { detail: String },

    #[error("marketplace error {status}: {detail}")]
    Marketplace { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("configured identity is invalid: {0}")]
    IdentityInvalid(String),
}

impl MonitorError {
    /// Error code written to `SessionState::last_error`.
    pub fn code(&self) -> u16 {
        match self {
            MonitorError::NoCredential | MonitorError::Auth { .. } => 401,
            MonitorError::Marketplace { status, .. } => *status,
            MonitorError::IdentityInvalid(_) => 404,
            MonitorError::Transport(_) | MonitorError::Timeout(_) => 0,
        }
    }

    /// True when the held credential must be replaced.
    pub fn is_auth(&self) -> bool {
        self.code() == 401
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        MonitorError::Transport(e.to_string())
    }
}
