//! Seams to the browser side: badge, login surface, tabs, alerts.

use serde::Deserialize;

use crate::reporter::{MonitorOutput, report_output};
use crate::signout::NavigationKind;
use crate::types::{Alert, BadgeColor, Header, LogEntry};
use crate::{APP_STUDIES_URL, APP_URL};

/// One event reported by the browser side, as a JSON line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrowserEvent {
    /// Outgoing request headers.
    RequestHeaders { url: String, headers: Vec<Header> },
    /// Response body delivered to the page.
    ResponseBody { url: String, body: String },
    /// `location` header of an authorize redirect.
    AuthRedirect { url: String, location: String },
    Navigation { url: String, kind: NavigationKind },
    /// Control message from the popup.
    Message { message: String },
    NotificationClicked { id: String },
}

/// Toolbar badge.
pub trait StatusIndicator: Send + Sync {
    fn set_badge_text(&self, text: &str);
    fn set_badge_color(&self, color: BadgeColor);
    /// Mirror of every session log append.
    fn log_appended(&self, _entry: &LogEntry) {}
}

/// Obtains a fresh credential out of band, e.g. by opening the login page.
/// Success shows up later as a new acquisition edge in observed traffic.
pub trait Reauthenticator: Send + Sync {
    fn reauthenticate(&self);
}

/// Opens a study from a clicked notification.
pub trait StudyOpener: Send + Sync {
    fn open_study(&self, id: &str);
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &Alert);
}

/// Realises every browser collaborator as JSON lines on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutBridge;

impl StatusIndicator for StdoutBridge {
    fn set_badge_text(&self, text: &str) {
        report_output(&MonitorOutput::BadgeText {
            text: text.to_string(),
        });
    }

    fn set_badge_color(&self, color: BadgeColor) {
        report_output(&MonitorOutput::BadgeColor { color });
    }

    fn log_appended(&self, entry: &LogEntry) {
        report_output(&MonitorOutput::Log {
            entry: entry.clone(),
        });
    }
}

impl Reauthenticator for StdoutBridge {
    fn reauthenticate(&self) {
        report_output(&MonitorOutput::OpenLogin {
            url: APP_URL.to_string(),
        });
    }
}

impl StudyOpener for StdoutBridge {
    fn open_study(&self, id: &str) {
        report_output(&MonitorOutput::OpenStudy {
            id: id.to_string(),
            url: study_url(id),
        });
    }
}

impl AlertSink for StdoutBridge {
    fn raise(&self, alert: &Alert) {
        report_output(&MonitorOutput::Alert {
            alert: alert.clone(),
        });
    }
}

pub fn study_url(id: &str) -> String {
    format!("{APP_STUDIES_URL}/{id}")
}
