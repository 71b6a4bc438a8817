// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! HTTP client: sign-in, bearer auth and single-flight token refresh.

#[path = "../support/mock_server.rs"]
mod mock_server;

use std::sync::Arc;
use std::time::Duration;

use courier::api::http::{HttpApi, Registration};
use courier::api::{ApiError, ChatApi, CredentialStore};
use courier::connection::CredentialSource;
use courier::session::{Session, SessionError};

use mock_server::{MockServer, PASSWORD, REFRESH_TOKEN};

#[tokio::test]
async fn login_stores_tokens() {
    let server = MockServer::start().await;
    let api = HttpApi::new(server.api_base(), CredentialStore::new()).unwrap();

    let user = api.login("alice", PASSWORD).await.unwrap();
    assert_eq!(user.username, "alice");
    assert!(api.credentials().is_signed_in());
    assert_eq!(api.credentials().access_token(), Some(server.access_token()));
    assert_eq!(api.credentials().refresh_token().as_deref(), Some(REFRESH_TOKEN));
}

#[tokio::test]
async fn bad_password_surfaces_server_detail() {
    let server = MockServer::start().await;
    let api = HttpApi::new(server.api_base(), CredentialStore::new()).unwrap();

    let err = api.login("alice", "wrong").await.unwrap_err();
    match err {
        ApiError::Status { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "No active account found with the given credentials");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(!api.credentials().is_signed_in());
}

#[tokio::test]
async fn expired_access_token_is_refreshed_and_retried() {
    let server = MockServer::start().await;
    let api = server.signed_in_api().await;
    let before = api.credentials().access_token();

    server.expire_access_token();
    let me = api.me().await.unwrap();
    assert_eq!(me.username, "alice");
    assert_eq!(server.refresh_calls(), 1);

    let after = api.credentials().access_token();
    assert_ne!(after, before);
    assert_eq!(after, Some(server.access_token()));
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockServer::start().await;
    let api = server.signed_in_api().await;
    server.set_refresh_delay(Duration::from_millis(100));
    server.expire_access_token();

    let (threads, history, presence) =
        tokio::join!(api.threads(), api.history("bob"), api.presence("bob"));
    threads.unwrap();
    history.unwrap();
    presence.unwrap();
    assert_eq!(server.refresh_calls(), 1);
}

#[tokio::test]
async fn rejected_refresh_clears_credentials() {
    let server = MockServer::start().await;
    let api = server.signed_in_api().await;
    server.expire_access_token();
    server.revoke_refresh_token();

    let err = api.threads().await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert!(!api.credentials().is_signed_in());

    // With nothing stored, the next request fails without another refresh.
    let calls = server.refresh_calls();
    assert!(matches!(api.me().await, Err(ApiError::Unauthorized)));
    assert_eq!(server.refresh_calls(), calls);
}

#[tokio::test]
async fn session_requires_credentials() {
    let server = MockServer::start().await;
    let api = Arc::new(HttpApi::new(server.api_base(), CredentialStore::new()).unwrap());

    let result = Session::start(api, server.session_config()).await;
    assert!(matches!(result, Err(SessionError::NotSignedIn)));
    assert_eq!(server.connects("inbox"), 0);
}

#[tokio::test]
async fn explicit_refresh_replaces_access_token() {
    let server = MockServer::start().await;
    let api = server.signed_in_api().await;

    let fresh = api.refresh().await.unwrap();
    assert_eq!(fresh, server.access_token());
    assert_eq!(api.credentials().access_token(), Some(fresh));
    assert_eq!(api.credentials().refresh_token().as_deref(), Some(REFRESH_TOKEN));
}

#[tokio::test]
async fn register_reports_validation_errors() {
    let server = MockServer::start().await;
    let api = HttpApi::new(server.api_base(), CredentialStore::new()).unwrap();

    let form = Registration {
        username: "dave".into(),
        password: "pw".into(),
        ..Registration::default()
    };
    api.register(&form).await.unwrap();
    assert!(!api.credentials().is_signed_in());

    let taken = Registration {
        username: "alice".into(),
        ..form
    };
    match api.register(&taken).await.unwrap_err() {
        ApiError::Status { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("already exists"));
        }
        other => panic!("expected status error, got {other:?}"),
    }
}
