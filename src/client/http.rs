use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use super::{FlagsApi, SharedToken};
use crate::api::{ErrorBody, UpsertRequest, WriteResponse};
use crate::document::{FeatureFlag, FlagListing, Revision};
use crate::error::{FlagError, Result};

/// [`FlagsApi`] over the panel's HTTP routes.
#[derive(Debug, Clone)]
pub struct HttpFlagsApi {
    client: reqwest::Client,
    base: Url,
    token: SharedToken,
}

impl HttpFlagsApi {
    pub fn new(base_url: &str, token: SharedToken) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: parse_base(base_url)?,
            token,
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn token(&self) -> &SharedToken {
        &self.token
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        join_segments(&self.base, segments)
    }

    fn request(&self, method: Method, url: Url, expected: Option<&Revision>) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(token) = self.token.get() {
            request = request.bearer_auth(token);
        }
        if let Some(expected) = expected {
            request = request.header(IF_MATCH, expected.to_etag());
        }
        request
    }

    async fn post(&self, body: &UpsertRequest, expected: Option<&Revision>) -> Result<Option<Revision>> {
        let url = self.endpoint(&["flags"])?;
        let response = send(self.request(Method::POST, url, expected).json(body)).await?;
        write_revision(response).await
    }
}

pub(crate) fn parse_base(base_url: &str) -> Result<Url> {
    Url::parse(base_url.trim())
        .map_err(|e| FlagError::InvalidArgument(format!("invalid server URL '{}': {}", base_url, e)))
}

/// Append path segments to the server URL, percent-encoding each one.
pub(crate) fn join_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FlagError::Transport(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| FlagError::Transport(e.to_string()))?;
    check_status(response).await
}

/// Map a non-success response onto the error kinds the panel reports.
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            if text.trim().is_empty() {
                status.to_string()
            } else {
                text
            }
        });
    debug!(%status, %message, "flags request failed");

    Err(match status {
        StatusCode::UNAUTHORIZED => FlagError::Unauthorized,
        StatusCode::BAD_REQUEST => FlagError::InvalidArgument(message),
        StatusCode::NOT_FOUND => FlagError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => FlagError::Conflict(message),
        _ => FlagError::StorageUnavailable(message),
    })
}

async fn write_revision(response: Response) -> Result<Option<Revision>> {
    let body: WriteResponse = response
        .json()
        .await
        .map_err(|e| FlagError::Transport(format!("unexpected response body: {}", e)))?;
    Ok(body.revision)
}

#[async_trait]
impl FlagsApi for HttpFlagsApi {
    async fn fetch(&self) -> Result<FlagListing> {
        let url = self.endpoint(&["flags"])?;
        let response = send(self.request(Method::GET, url, None)).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(Revision::from_etag);

        let mut listing: FlagListing = response
            .json()
            .await
            .map_err(|e| FlagError::Transport(format!("unexpected response body: {}", e)))?;
        if listing.revision.is_none() {
            listing.revision = etag;
        }
        Ok(listing)
    }

    async fn upsert(
        &self,
        key: &str,
        enabled: bool,
        old_key: Option<&str>,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>> {
        let body = UpsertRequest {
            key: Some(key.to_string()),
            enabled: Some(enabled),
            old_key: old_key.map(String::from),
            ..Default::default()
        };
        self.post(&body, expected).await
    }

    async fn save_batch(
        &self,
        changes: &[FeatureFlag],
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>> {
        let body = UpsertRequest {
            batch: Some(changes.to_vec()),
            ..Default::default()
        };
        self.post(&body, expected).await
    }

    async fn set_maintenance(
        &self,
        enabled: bool,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>> {
        let body = UpsertRequest {
            is_maintenance: Some(enabled),
            ..Default::default()
        };
        self.post(&body, expected).await
    }

    async fn delete(&self, key: &str, expected: Option<&Revision>) -> Result<Option<Revision>> {
        let url = self.endpoint(&["flags", key])?;
        let response = send(self.request(Method::DELETE, url, expected)).await?;
        write_revision(response).await
    }
}
