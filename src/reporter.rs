use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::browser::StatusIndicator;
use crate::state::SessionState;
use crate::types::{Alert, Badge, BadgeColor, LogEntry, LogKind};

/// One collaborator call, as seen by the browser side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorOutput {
    BadgeText { text: String },
    BadgeColor { color: BadgeColor },
    OpenLogin { url: String },
    OpenStudy { id: String, url: String },
    Alert { alert: Alert },
    Log { entry: LogEntry },
}

/// Emit a collaborator call as a single JSON line to stdout.
pub fn report_output(output: &MonitorOutput) {
    if let Ok(json) = serde_json::to_string(output) {
        println!("{json}");
    }
}

/// Badge-level status of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Polling,
    Healthy,
    Error,
    AuthError,
    /// Studies are listed.
    Count(usize),
    /// Listing succeeded and was empty.
    ZeroResults,
}

impl Status {
    pub fn badge(&self) -> Badge {
        let (text, color) = match self {
            Status::Polling => ("...".to_string(), BadgeColor::Orange),
            Status::Healthy | Status::ZeroResults => ("OK".to_string(), BadgeColor::Lime),
            Status::Error => ("ERR".to_string(), BadgeColor::Black),
            Status::AuthError => ("!".to_string(), BadgeColor::Red),
            Status::Count(n) => (n.to_string(), BadgeColor::Red),
        };
        Badge { text, color }
    }
}

/// Turns loop outcomes into badge updates and session log entries.
#[derive(Clone)]
pub struct Reporter {
    indicator: Arc<dyn StatusIndicator>,
}

impl Reporter {
    pub fn new(indicator: Arc<dyn StatusIndicator>) -> Self {
        Self { indicator }
    }

    pub fn status(&self, state: &mut SessionState, status: Status) {
        let badge = status.badge();
        self.indicator.set_badge_text(&badge.text);
        self.indicator.set_badge_color(badge.color);
        state.badge = badge;
    }

    pub fn log(&self, state: &mut SessionState, data: &str, kind: LogKind, description: &str) {
        let entry = state.append_log(data, kind, description);
        match kind {
            LogKind::Error => warn!("{data}: {}", description.replace('\n', " ")),
            _ => info!("{data}"),
        }
        self.indicator.log_appended(&entry);
    }
}
