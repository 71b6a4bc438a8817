//! HTTP collaborator used by the realtime core.
//!
//! The session only needs a handful of read endpoints plus the shared
//! credential store; [`ChatApi`] captures exactly that so tests can swap
//! in an in-memory implementation. [`http::HttpApi`] is the real client.

pub mod http;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use courier_proto::message::{Message, PeerUserInfo};
use courier_proto::presence::PresenceSnapshot;
use courier_proto::thread::ThreadListEntry;

use crate::connection::CredentialSource;

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Short-lived bearer token.
    pub access: String,
    /// Long-lived token used to mint a new access token.
    pub refresh: Option<String>,
}

impl Credentials {
    /// Creates a token pair.
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: access.into(),
            refresh,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shared, cloneable credential store.
///
/// Written by the HTTP client on login/refresh/logout, read by every
/// connection attempt.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    inner: Arc<RwLock<Option<Credentials>>>,
}

impl CredentialStore {
    /// Creates an empty (signed-out) store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `credentials`.
    #[must_use]
    pub fn with(credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(credentials))),
        }
    }

    /// Replaces the stored credentials.
    pub fn set(&self, credentials: Credentials) {
        *self.inner.write() = Some(credentials);
    }

    /// Replaces only the access token, keeping the refresh token.
    pub fn set_access(&self, access: impl Into<String>) {
        let mut guard = self.inner.write();
        match guard.as_mut() {
            Some(creds) => creds.access = access.into(),
            None => *guard = Some(Credentials::new(access, None)),
        }
    }

    /// Forgets all credentials.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.inner.read().as_ref().and_then(|c| c.refresh.clone())
    }

    /// Whether any credentials are held.
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl CredentialSource for CredentialStore {
    fn access_token(&self) -> Option<String> {
        self.inner.read().as_ref().map(|c| c.access.clone())
    }
}

/// Errors from the HTTP collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credentials are missing, or were rejected and could not be refreshed.
    #[error("not authorized")]
    Unauthorized,
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// An endpoint URL could not be built.
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
    /// Network failure or undecodable response.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Read-side HTTP endpoints the session depends on.
pub trait ChatApi: Send + Sync + 'static {
    /// The credential store shared with the connection layer.
    fn credentials(&self) -> &CredentialStore;

    /// The signed-in user.
    fn me(&self) -> impl Future<Output = Result<PeerUserInfo, ApiError>> + Send;

    /// The thread list.
    fn threads(&self) -> impl Future<Output = Result<Vec<ThreadListEntry>, ApiError>> + Send;

    /// Message history with `peer`, oldest first.
    fn history(&self, peer: &str)
    -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Current presence of `peer`.
    fn presence(
        &self,
        peer: &str,
    ) -> impl Future<Output = Result<PresenceSnapshot, ApiError>> + Send;
}
