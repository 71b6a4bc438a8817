//! `reqwest` implementation of [`ChatApi`] with bearer auth and token refresh.
//!
//! A 401 on any authenticated request triggers one refresh and one retry.
//! Concurrent 401s share a single refresh: the first caller posts the
//! refresh token while the rest wait on `refresh_lock` and then reuse the
//! token it stored.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use courier_proto::message::{Message, PeerUserInfo};
use courier_proto::presence::PresenceSnapshot;
use courier_proto::thread::ThreadListEntry;

use super::{ApiError, ChatApi, CredentialStore, Credentials};
use crate::connection::CredentialSource;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
    user: PeerUserInfo,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    /// Present when the server rotates refresh tokens.
    #[serde(default)]
    refresh: Option<String>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// Account creation form.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Registration {
    /// Desired username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Optional e-mail address.
    pub email: String,
    /// Optional given name.
    pub first_name: String,
    /// Optional family name.
    pub last_name: String,
}

/// HTTP client for the chat REST API.
#[derive(Debug)]
pub struct HttpApi {
    client: Client,
    base: Url,
    credentials: CredentialStore,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl HttpApi {
    /// Creates a client for the API rooted at `base` (e.g. `http://host/api/`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Request`] if the HTTP client cannot be built.
    pub fn new(base: Url, credentials: CredentialStore) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base, credentials))
    }

    /// Creates a client around an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: Client, base: Url, credentials: CredentialStore) -> Self {
        Self {
            client,
            base,
            credentials,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Signs in and stores the returned token pair.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Status`] with the server's detail message on bad
    /// credentials, or [`ApiError::Request`] on network failure.
    pub async fn login(&self, username: &str, password: &str) -> Result<PeerUserInfo, ApiError> {
        let url = self.endpoint(&["auth", "login", ""])?;
        let response = self
            .client
            .post(url)
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let body: LoginResponse = decode(response).await?;
        self.credentials
            .set(Credentials::new(body.access, Some(body.refresh)));
        tracing::info!(username = %body.user.username, "signed in");
        Ok(body.user)
    }

    /// Creates an account. Does not sign in.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Status`] when the server rejects the form.
    pub async fn register(&self, registration: &Registration) -> Result<(), ApiError> {
        let url = self.endpoint(&["auth", "register", ""])?;
        let response = self.client.post(url).json(registration).send().await?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }

    /// Mints a new access token from the stored refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] (and clears the credentials) when
    /// the refresh token is missing or rejected.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        let stale = self.credentials.access_token();
        self.refresh_after(stale.as_deref()).await
    }

    /// Refreshes unless another caller already replaced `stale`.
    async fn refresh_after(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.credentials.access_token()
            && Some(current.as_str()) != stale
        {
            return Ok(current);
        }

        let Some(refresh) = self.credentials.refresh_token() else {
            self.credentials.clear();
            return Err(ApiError::Unauthorized);
        };

        let url = self.endpoint(&["auth", "refresh", ""])?;
        let response = self
            .client
            .post(url)
            .json(&RefreshRequest { refresh: &refresh })
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "token refresh rejected, clearing credentials");
            self.credentials.clear();
            return Err(ApiError::Unauthorized);
        }

        let body: RefreshResponse = response.json().await?;
        match body.refresh {
            Some(rotated) => self
                .credentials
                .set(Credentials::new(body.access.clone(), Some(rotated))),
            None => self.credentials.set_access(body.access.clone()),
        }
        tracing::debug!("access token refreshed");
        Ok(body.access)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GETs `segments` with bearer auth, refreshing once on 401.
    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.endpoint(segments)?;
        let token = self.credentials.access_token();

        let response = bearer(self.client.get(url.clone()), token.as_deref())
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return decode(response).await;
        }

        tracing::debug!(path = url.path(), "request unauthorized, refreshing token");
        let fresh = self.refresh_after(token.as_deref()).await?;
        let retry = bearer(self.client.get(url), Some(&fresh)).send().await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        decode(retry).await
    }
}

impl ChatApi for HttpApi {
    fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn me(&self) -> Result<PeerUserInfo, ApiError> {
        self.get_json(&["auth", "me", ""]).await
    }

    async fn threads(&self) -> Result<Vec<ThreadListEntry>, ApiError> {
        self.get_json(&["chat", "users", ""]).await
    }

    async fn history(&self, peer: &str) -> Result<Vec<Message>, ApiError> {
        self.get_json(&["chat", "history", peer, ""]).await
    }

    async fn presence(&self, peer: &str) -> Result<PresenceSnapshot, ApiError> {
        self.get_json(&["chat", "presence", peer, ""]).await
    }
}

fn bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// Decodes a success body, or turns the response into an [`ApiError`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorDetail>(&text)
        .map(|e| e.detail)
        .unwrap_or(text);
    Err(ApiError::Status {
        status: status.as_u16(),
        body: truncate(body),
    })
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
