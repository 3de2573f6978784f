use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::auth::Credential;
use crate::error::MonitorError;
use crate::types::{AccountInfo, ApiError, ApiResponse, Study};

/// Marketplace endpoints used by the polling loop.
///
/// Implementations hold no session state and never retry; the loop's fixed
/// interval is the retry policy.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Studies currently open to this participant.
    async fn fetch_studies(
        &self,
        credential: &Credential,
    ) -> Result<ApiResponse<Study>, MonitorError>;

    async fn fetch_account(
        &self,
        credential: &Credential,
        uid: &str,
    ) -> Result<AccountInfo, MonitorError>;

    async fn fetch_submissions(
        &self,
        credential: &Credential,
        uid: &str,
    ) -> Result<ApiResponse<Value>, MonitorError>;

    /// Claim a place in a study.
    async fn start_study(
        &self,
        credential: &Credential,
        uid: &str,
        study_id: &str,
    ) -> Result<(), MonitorError>;

    /// Lightweight existence check: the account lookup must echo the same id.
    async fn check_user_id(&self, credential: &Credential, uid: &str) -> Result<bool, MonitorError> {
        match self.fetch_account(credential, uid).await {
            Ok(account) => Ok(account.id.as_deref() == Some(uid)),
            Err(MonitorError::Marketplace { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// `reqwest` implementation against the Prolific REST API.
pub struct HttpMarketplace {
    client: Client,
    base: String,
}

impl HttpMarketplace {
    pub fn new(api_base: &str) -> Self {
        Self {
            client: Client::new(),
            base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Attach the credential. One that is not a valid header is treated as
    /// rejected, so the loop re-authenticates instead of polling anonymously.
    fn authorized(
        &self,
        req: RequestBuilder,
        credential: &Credential,
    ) -> Result<RequestBuilder, MonitorError> {
        match (
            HeaderName::from_bytes(credential.header_name.as_bytes()),
            HeaderValue::from_str(&credential.value),
        ) {
            (Ok(name), Ok(value)) => Ok(req.header(name, value)),
            _ => {
                warn!("Held credential {credential:?} is not a valid HTTP header");
                Err(MonitorError::Auth {
                    detail: "credential is not a valid HTTP header".to_string(),
                })
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        credential: &Credential,
    ) -> Result<ApiResponse<T>, MonitorError> {
        let resp = self.authorized(req, credential)?.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!("Marketplace responded {status} ({} bytes)", body.len());
        interpret(status, &body)
    }

    async fn send_value(
        &self,
        req: RequestBuilder,
        credential: &Credential,
    ) -> Result<(u16, Value), MonitorError> {
        let resp = self.authorized(req, credential)?.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok((status, parse_body(&body)?))
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn fetch_studies(
        &self,
        credential: &Credential,
    ) -> Result<ApiResponse<Study>, MonitorError> {
        let req = self
            .client
            .get(self.url("studies/"))
            .query(&[("current", "1")]);
        self.send(req, credential).await
    }

    async fn fetch_account(
        &self,
        credential: &Credential,
        uid: &str,
    ) -> Result<AccountInfo, MonitorError> {
        let req = self.client.get(self.url(&format!("users/{uid}/")));
        let (status, value) = self.send_value(req, credential).await?;
        account_from_value(status, value)
    }

    async fn fetch_submissions(
        &self,
        credential: &Credential,
        uid: &str,
    ) -> Result<ApiResponse<Value>, MonitorError> {
        let req = self
            .client
            .get(self.url("submissions/"))
            .query(&[("participant", uid), ("page", "1")]);
        self.send(req, credential).await
    }

    async fn start_study(
        &self,
        credential: &Credential,
        uid: &str,
        study_id: &str,
    ) -> Result<(), MonitorError> {
        let req = self
            .client
            .post(self.url("submissions/"))
            .json(&json!({ "study_id": study_id, "participant_id": uid }));
        let (status, value) = self.send_value(req, credential).await?;
        match error_of(status, &value) {
            Some(err) => Err(err.into_error()),
            None => Ok(()),
        }
    }
}

fn parse_body(body: &str) -> Result<Value, MonitorError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body)
        .map_err(|e| MonitorError::Transport(format!("malformed response body: {e}")))
}

/// The `error` member, or a synthetic one for a non-2xx status without it.
fn error_of(status: u16, value: &Value) -> Option<ApiError> {
    match value.get("error") {
        Some(err) if !err.is_null() => Some(ApiError::from_value(err, status)),
        _ if !(200..300).contains(&status) => Some(ApiError {
            status,
            detail: value.clone(),
        }),
        _ => None,
    }
}

/// Decode a listing-style body into its `results` / `error` parts.
///
/// Both may be present; precedence is left to the caller. Entries that do not
/// decode are dropped one by one.
pub fn interpret<T: DeserializeOwned>(status: u16, body: &str) -> Result<ApiResponse<T>, MonitorError> {
    let value = parse_body(body)?;
    let error = error_of(status, &value);
    let results = match value.get("results") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| match serde_json::from_value(item.clone()) {
                    Ok(decoded) => Some(decoded),
                    Err(e) => {
                        debug!("Skipping malformed result: {e}");
                        None
                    }
                })
                .collect(),
        ),
        _ => None,
    };
    Ok(ApiResponse { results, error })
}

fn account_from_value(status: u16, value: Value) -> Result<AccountInfo, MonitorError> {
    if let Some(err) = error_of(status, &value) {
        return Err(err.into_error());
    }
    serde_json::from_value(value)
        .map_err(|e| MonitorError::Transport(format!("malformed account: {e}")))
}
