use serde::Deserialize;

use crate::{APP_LOGIN_URL, LOGIN_PAGE_URL};

/// Browser navigation event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationKind {
    /// A full page load finished.
    Completed,
    /// The single-page app pushed a new history entry.
    HistoryStateUpdated,
}

/// True when the navigation means the user has been signed out.
pub fn is_sign_out(url: &str, kind: NavigationKind) -> bool {
    match kind {
        NavigationKind::Completed => url == LOGIN_PAGE_URL,
        NavigationKind::HistoryStateUpdated => url == APP_LOGIN_URL,
    }
}
