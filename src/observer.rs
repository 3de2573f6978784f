//! Passive extraction of the credential and account id from the page's own
//! traffic. Nothing here alters what the page receives; every failure is
//! swallowed and reported as `None`.

use serde_json::Value;
use url::Url;

use crate::auth::Credential;
use crate::types::{AccountInfo, Header};
use crate::{API_URL_PREFIX, USERS_URL_PREFIX};

/// Most bytes buffered from one response for decoding.
pub const TAP_LIMIT: usize = 1024 * 1024;

/// Requests whose headers are inspected for a credential.
pub fn is_api_request(url: &str) -> bool {
    url.starts_with(API_URL_PREFIX)
}

/// Responses tapped for the account id.
pub fn is_identity_endpoint(url: &str) -> bool {
    url.starts_with(USERS_URL_PREFIX) && !url.contains("/firebase/")
}

/// First usable `Authorization` header on a marketplace API request.
pub fn credential_from_request(url: &str, headers: &[Header]) -> Option<Credential> {
    if !is_api_request(url) {
        return None;
    }
    headers.iter().find_map(Credential::from_header)
}

/// Identity learned from an intercepted response.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedIdentity {
    pub uid: String,
    /// Set when the id came from a decoded body.
    pub account: Option<AccountInfo>,
}

/// Decode the body as the account record and take its `id`.
pub fn identity_from_body(body: &[u8]) -> Option<ObservedIdentity> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let account: AccountInfo = serde_json::from_value(value).ok()?;
    let uid = account.id.clone().filter(|id| !id.is_empty())?;
    Some(ObservedIdentity {
        uid,
        account: Some(account),
    })
}

/// Path segment following `users/`, e.g. `.../api/v1/users/abc123/`.
pub fn identity_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "users")?;
    segments
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Body decode first, URL path second.
pub fn observe_identity(url: &str, body: &[u8]) -> Option<ObservedIdentity> {
    if !is_identity_endpoint(url) {
        return None;
    }
    identity_from_body(body).or_else(|| {
        identity_from_url(url).map(|uid| ObservedIdentity { uid, account: None })
    })
}

/// Pass-through tap over a streamed response body.
///
/// Every chunk is handed back untouched; a copy is kept (up to `TAP_LIMIT`)
/// for a decode attempt once the stream ends.
#[derive(Debug)]
pub struct ResponseTap {
    url: String,
    buffer: Vec<u8>,
    overflowed: bool,
}

impl ResponseTap {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    pub fn pass<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        if !self.overflowed {
            if self.buffer.len() + chunk.len() > TAP_LIMIT {
                self.overflowed = true;
                self.buffer = Vec::new();
            } else {
                self.buffer.extend_from_slice(chunk);
            }
        }
        chunk
    }

    /// Falls back to the URL when the body overflowed or does not decode.
    pub fn finish(self) -> Option<ObservedIdentity> {
        if self.overflowed {
            if !is_identity_endpoint(&self.url) {
                return None;
            }
            return identity_from_url(&self.url).map(|uid| ObservedIdentity { uid, account: None });
        }
        observe_identity(&self.url, &self.buffer)
    }
}
