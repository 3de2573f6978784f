use serde::Serialize;

use crate::api::Marketplace;
use crate::auth::Credential;

/// Where the current identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// Lifted from the page's own traffic. Authoritative for the process lifetime.
    Observed,
    /// Taken from settings after a successful marketplace check.
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentIdentity {
    pub uid: String,
    pub source: IdentitySource,
}

impl CurrentIdentity {
    pub fn observed(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            source: IdentitySource::Observed,
        }
    }

    pub fn configured(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            source: IdentitySource::Configured,
        }
    }
}

/// Outcome of reconciling the held identity with the configured one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// An observed identity is held; settings are not consulted.
    KeepObserved,
    /// The configured id passed validation and becomes current.
    Adopt(CurrentIdentity),
    /// The configured id failed validation; nothing changes.
    Invalid { uid: String, reason: String },
}

/// Decide which identity to use for user-scoped queries.
///
/// An observed identity is never replaced. Otherwise the configured id is
/// checked against the marketplace and adopted only if it exists.
pub async fn reconcile(
    market: &dyn Marketplace,
    credential: &Credential,
    current: Option<&CurrentIdentity>,
    configured: &str,
) -> Reconciliation {
    if current.is_some_and(|c| c.source == IdentitySource::Observed) {
        return Reconciliation::KeepObserved;
    }

    let uid = configured.trim();
    if uid.is_empty() {
        return Reconciliation::Invalid {
            uid: String::new(),
            reason: "no id configured".to_string(),
        };
    }

    match market.check_user_id(credential, uid).await {
        Ok(true) => Reconciliation::Adopt(CurrentIdentity::configured(uid)),
        Ok(false) => Reconciliation::Invalid {
            uid: uid.to_string(),
            reason: "unknown to the marketplace".to_string(),
        },
        Err(e) => Reconciliation::Invalid {
            uid: uid.to_string(),
            reason: e.to_string(),
        },
    }
}
