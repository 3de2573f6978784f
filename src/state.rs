use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::auth::Credential;
use crate::identity::CurrentIdentity;
use crate::types::{AccountInfo, Alert, Badge, LogEntry, LogKind, PollState, Study};

/// Number of session log entries kept for the UI.
pub const LOG_CAPACITY: usize = 300;

/// Bounded FIFO of log entries; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

/// Process-wide session record.
///
/// Created empty at startup and mutated only by the polling loop and the
/// traffic/navigation handlers that share it.
#[derive(Debug, Default)]
pub struct SessionState {
    pub credential: Option<Credential>,
    /// `id_token` from the OAuth redirect, when that path supplied the credential.
    pub id_token: Option<String>,
    pub identity: Option<CurrentIdentity>,
    pub account_info: Option<AccountInfo>,
    pub studies: Vec<Study>,
    pub submissions: Vec<Value>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<u16>,
    pub poll_state: PollState,
    pub badge: Badge,
    pub alerts: Vec<Alert>,
    pub logs: LogBuffer,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_log(&mut self, data: &str, kind: LogKind, description: &str) -> LogEntry {
        let entry = LogEntry {
            data: data.to_string(),
            kind,
            timestamp: Utc::now().timestamp_millis(),
            description: description.to_string(),
        };
        self.logs.push(entry.clone());
        entry
    }

    /// Store a credential. Returns `true` on an acquisition edge (none was held).
    pub fn set_credential(&mut self, credential: Credential) -> bool {
        let acquired = self.credential.is_none();
        self.credential = Some(credential);
        acquired
    }

    pub fn clear_credential(&mut self) {
        self.credential = None;
        self.id_token = None;
    }

    pub fn uid(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.uid.as_str())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            authenticated: self.credential.is_some(),
            identity: self.identity.clone(),
            account_info: self.account_info.clone(),
            studies: self.studies.clone(),
            submissions: self.submissions.clone(),
            last_checked: self.last_checked,
            last_error: self.last_error,
            poll_state: self.poll_state,
            badge: self.badge.clone(),
            alerts: self.alerts.clone(),
            logs: self.logs.iter().cloned().collect(),
        }
    }
}

/// Read-only view of the session for the UI layer. Never carries the credential.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub identity: Option<CurrentIdentity>,
    pub account_info: Option<AccountInfo>,
    pub studies: Vec<Study>,
    pub submissions: Vec<Value>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<u16>,
    pub poll_state: PollState,
    pub badge: Badge,
    pub alerts: Vec<Alert>,
    pub logs: Vec<LogEntry>,
}

/// Session state shared between the polling actor and event handlers.
pub type SharedSession = Arc<Mutex<SessionState>>;

/// Lock the session. Never hold the guard across an `.await`.
pub fn lock(session: &SharedSession) -> MutexGuard<'_, SessionState> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}
