use std::fmt;

use url::Url;

use crate::types::Header;

/// Header name the page uses for its bearer token.
pub const AUTHORIZATION: &str = "Authorization";

/// Value the page sends before anyone has logged in.
const UNAUTHENTICATED_PLACEHOLDER: &str = "Bearer null";

/// Bearer credential lifted from the page's own traffic.
///
/// Valid until explicitly cleared (sign-out or replacement). The value is
/// redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub header_name: String,
    pub value: String,
}

impl Credential {
    /// Accept an `Authorization` header unless it carries the placeholder
    /// value of an unauthenticated page.
    pub fn from_header(header: &Header) -> Option<Self> {
        if !header.name.eq_ignore_ascii_case(AUTHORIZATION) {
            return None;
        }
        let value = header.value.trim();
        if value.is_empty() || value == UNAUTHENTICATED_PLACEHOLDER {
            return None;
        }
        Some(Self {
            header_name: AUTHORIZATION.to_string(),
            value: value.to_string(),
        })
    }

    pub fn bearer(token: &str) -> Self {
        Self {
            header_name: AUTHORIZATION.to_string(),
            value: format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self
            .value
            .char_indices()
            .rev()
            .nth(3)
            .map(|(i, _)| &self.value[i..])
            .unwrap_or("");
        f.debug_struct("Credential")
            .field("header_name", &self.header_name)
            .field("value", &format_args!("…{tail}"))
            .finish()
    }
}

/// Tokens delivered by the OAuth implicit-grant redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTokens {
    pub credential: Credential,
    pub id_token: Option<String>,
}

/// Parse the `location` of an authorize redirect:
/// `https://app.prolific.co/oauth/callback#access_token=..&id_token=..`.
pub fn tokens_from_redirect(location: &str) -> Option<RedirectTokens> {
    let url = Url::parse(location).ok()?;
    let fragment = url.fragment()?;

    let mut access_token = None;
    let mut id_token = None;
    for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
        match key.as_ref() {
            "access_token" if !value.is_empty() => access_token = Some(value.into_owned()),
            "id_token" if !value.is_empty() => id_token = Some(value.into_owned()),
            _ => {}
        }
    }

    Some(RedirectTokens {
        credential: Credential::bearer(&access_token?),
        id_token,
    })
}
