use reqwest::{Method, Url};
use tokio::sync::watch;
use tracing::{debug, info};

use super::http::{join_segments, parse_base, send};
use super::{HttpFlagsApi, SharedToken};
use crate::api::{SessionResponse, SignInRequest, User};
use crate::error::{FlagError, Result};

/// Signs an operator in against the panel and tracks the current user.
///
/// The token obtained at sign-in is shared with every [`HttpFlagsApi`]
/// created through [`SessionClient::flags_api`].
pub struct SessionClient {
    client: reqwest::Client,
    base: Url,
    token: SharedToken,
    user: watch::Sender<Option<User>>,
}

impl SessionClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let (user, _) = watch::channel(None);
        Ok(Self {
            client: reqwest::Client::new(),
            base: parse_base(base_url)?,
            token: SharedToken::default(),
            user,
        })
    }

    /// Reuse a token from an earlier sign-in or a configured API token.
    pub fn with_token(self, token: Option<String>) -> Self {
        self.token.set(token);
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.get()
    }

    pub fn current_user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    /// Notified with the user on sign-in and `None` on sign-out or expiry.
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    pub fn flags_api(&self) -> Result<HttpFlagsApi> {
        Ok(HttpFlagsApi::new(self.base.as_str(), self.token.clone())?.with_client(self.client.clone()))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let body = SignInRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let url = self.endpoint(&["auth", "sign-in"])?;
        let response = send(self.client.post(url).json(&body)).await?;
        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| FlagError::Transport(format!("unexpected response body: {}", e)))?;

        self.token.set(session.token);
        self.user.send_replace(Some(session.user.clone()));
        info!(email = %session.user.email, "signed in");
        Ok(session.user)
    }

    /// End the session on the server and forget it locally. The local state
    /// is cleared even when the server cannot be reached.
    pub async fn sign_out(&self) -> Result<()> {
        let result = match self.endpoint(&["auth", "sign-out"]) {
            Ok(url) => send(self.authorized(Method::POST, url)).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.token.set(None);
        self.user.send_replace(None);
        result
    }

    /// Ask the server who the current token belongs to.
    pub async fn refresh(&self) -> Result<Option<User>> {
        if self.token.get().is_none() {
            self.user.send_replace(None);
            return Ok(None);
        }

        let url = self.endpoint(&["auth", "session"])?;
        match send(self.authorized(Method::GET, url)).await {
            Ok(response) => {
                let session: SessionResponse = response.json().await.map_err(|e| {
                    FlagError::Transport(format!("unexpected response body: {}", e))
                })?;
                self.user.send_replace(Some(session.user.clone()));
                Ok(Some(session.user))
            }
            Err(FlagError::Unauthorized) => {
                debug!("session is no longer valid");
                self.token.set(None);
                self.user.send_replace(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn authorized(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match self.token.get() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        join_segments(&self.base, segments)
    }
}
