use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MonitorError;

/// A study listed by the marketplace.
///
/// Only `id` and `reward` are interpreted; every other field is carried through
/// untouched so the UI layer can render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: String,
    /// Reward in the marketplace's minor currency unit.
    #[serde(default)]
    pub reward: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Account record returned by `users/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error object embedded in a marketplace response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub detail: Value,
}

impl ApiError {
    /// Build from the `error` member of a response body. `fallback_status` is the
    /// HTTP status, used when the object carries no numeric `status` of its own.
    pub fn from_value(value: &Value, fallback_status: u16) -> Self {
        let status = value
            .get("status")
            .and_then(Value::as_u64)
            .or_else(|| value.as_u64())
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(fallback_status);
        Self {
            status,
            detail: value.clone(),
        }
    }

    pub fn is_auth(&self) -> bool {
        self.status == 401
    }

    pub fn into_error(self) -> MonitorError {
        if self.is_auth() {
            MonitorError::Auth {
                detail: self.detail.to_string(),
            }
        } else {
            MonitorError::Marketplace {
                status: self.status,
                detail: self.detail.to_string(),
            }
        }
    }
}

/// Shape-tagged marketplace response: `results`, `error`, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub results: Option<Vec<T>>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(results: Vec<T>) -> Self {
        Self {
            results: Some(results),
            error: None,
        }
    }

    pub fn err(status: u16) -> Self {
        Self {
            results: None,
            error: Some(ApiError {
                status,
                detail: serde_json::json!({ "status": status }),
            }),
        }
    }
}

/// Category of a session log entry. Serialized names are what the UI filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    #[serde(rename = "0-studies")]
    ZeroStudies,
    #[serde(rename = "studies")]
    Studies,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "info")]
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub data: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeColor {
    Orange,
    Lime,
    Black,
    Red,
}

impl BadgeColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeColor::Orange => "orange",
            BadgeColor::Lime => "lime",
            BadgeColor::Black => "black",
            BadgeColor::Red => "red",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub text: String,
    pub color: BadgeColor,
}

impl Default for Badge {
    fn default() -> Self {
        Self {
            text: String::new(),
            color: BadgeColor::Red,
        }
    }
}

/// Polling loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    #[default]
    NoCredential,
    Polling,
    Ok,
    MarketplaceError,
    AuthError,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollState::NoCredential => write!(f, "NO_CREDENTIAL"),
            PollState::Polling => write!(f, "POLLING"),
            PollState::Ok => write!(f, "OK"),
            PollState::MarketplaceError => write!(f, "MARKETPLACE_ERROR"),
            PollState::AuthError => write!(f, "AUTH_ERROR"),
        }
    }
}

/// Inbound control messages from the popup UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// `check_for_studies`
    CheckForStudies,
    /// `check_for_studies-cuid`: check, then alert whether the configured id is in use.
    CheckAndValidateId,
}

impl FromStr for ControlMessage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_for_studies" => Ok(ControlMessage::CheckForStudies),
            "check_for_studies-cuid" => Ok(ControlMessage::CheckAndValidateId),
            other => Err(format!("unknown control message: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Ok,
    Error,
}

/// One-shot user-facing alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub text: String,
}

/// A single HTTP header as reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}
