//! In-process chat backend for integration tests.
//!
//! Serves the REST endpoints under `/api/` and the three socket channels
//! under `/ws/`. Sockets authenticate with `?token=` and are rejected with
//! 403 on a bad token, before the upgrade. Every decodable client frame is
//! recorded; tests push server frames with [`MockServer::push`] and drop
//! every open socket with [`MockServer::kill_sockets`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use url::Url;

use courier::api::CredentialStore;
use courier::api::http::HttpApi;
use courier::connection::ReconnectConfig;
use courier::session::SessionConfig;
use courier::typing::TypingConfig;
use courier_proto::event::Outbound;

/// Password accepted by `/api/auth/login/`.
pub const PASSWORD: &str = "secret";

/// Refresh token handed out at login.
pub const REFRESH_TOKEN: &str = "refresh-1";

#[derive(Clone, Debug)]
struct Push {
    channel: String,
    frame: String,
}

struct ServerState {
    access_token: Mutex<String>,
    refresh_valid: Mutex<bool>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    minted: AtomicUsize,
    me: Value,
    threads: Mutex<Value>,
    history: Mutex<HashMap<String, Value>>,
    presence: Mutex<Value>,
    presence_polls: AtomicUsize,
    received: Mutex<Vec<(String, Outbound)>>,
    connects: Mutex<HashMap<String, usize>>,
    open_sockets: Mutex<HashMap<String, usize>>,
    push: broadcast::Sender<Push>,
    kill: broadcast::Sender<()>,
}

impl ServerState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.access_token.lock());
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }

    fn record(&self, channel: &str, event: Outbound) {
        self.received.lock().push((channel.to_owned(), event));
    }
}

/// Handle to a running mock backend.
pub struct MockServer {
    /// Bound address.
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Starts a backend for user `alice` (id 1) on an ephemeral port.
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(ServerState {
            access_token: Mutex::new("access-0".to_owned()),
            refresh_valid: Mutex::new(true),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            minted: AtomicUsize::new(0),
            me: json!({"id": 1, "username": "alice"}),
            threads: Mutex::new(json!([])),
            history: Mutex::new(HashMap::new()),
            presence: Mutex::new(json!({"online": true, "last_seen": null})),
            presence_polls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            connects: Mutex::new(HashMap::new()),
            open_sockets: Mutex::new(HashMap::new()),
            push,
            kill,
        });

        let app = Router::new()
            .route("/api/auth/login/", post(login))
            .route("/api/auth/register/", post(register))
            .route("/api/auth/refresh/", post(refresh))
            .route("/api/auth/me/", get(me))
            .route("/api/chat/users/", get(users))
            .route("/api/chat/history/{peer}/", get(history))
            .route("/api/chat/presence/{peer}/", get(presence))
            .route("/ws/inbox/", get(inbox_ws))
            .route("/ws/presence/", get(presence_ws))
            .route("/ws/chat/{peer}/", get(chat_ws))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    /// REST base URL.
    pub fn api_base(&self) -> Url {
        Url::parse(&format!("http://{}/api/", self.addr)).unwrap()
    }

    /// Socket base URL.
    pub fn ws_base(&self) -> Url {
        Url::parse(&format!("ws://{}/ws/", self.addr)).unwrap()
    }

    /// The access token currently accepted.
    pub fn access_token(&self) -> String {
        self.state.access_token.lock().clone()
    }

    /// Invalidates the current access token without telling the client.
    pub fn expire_access_token(&self) {
        *self.state.access_token.lock() = "expired-elsewhere".to_owned();
    }

    /// Makes `/api/auth/refresh/` reject every request.
    pub fn revoke_refresh_token(&self) {
        *self.state.refresh_valid.lock() = false;
    }

    /// Slows down `/api/auth/refresh/`.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock() = delay;
    }

    /// Number of refresh requests served.
    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Replaces the thread list.
    pub fn set_threads(&self, threads: Value) {
        *self.state.threads.lock() = threads;
    }

    /// Replaces the history with `peer`.
    pub fn set_history(&self, peer: &str, messages: Value) {
        self.state.history.lock().insert(peer.to_owned(), messages);
    }

    /// Replaces the presence snapshot returned for every peer.
    pub fn set_presence(&self, snapshot: Value) {
        *self.state.presence.lock() = snapshot;
    }

    /// Number of presence polls served.
    pub fn presence_polls(&self) -> usize {
        self.state.presence_polls.load(Ordering::SeqCst)
    }

    /// Sends `frame` on every open socket of `channel` (e.g. `"chat/bob"`).
    pub fn push(&self, channel: &str, frame: &Value) {
        let _ = self.state.push.send(Push {
            channel: channel.to_owned(),
            frame: frame.to_string(),
        });
    }

    /// Drops every open socket without a close frame.
    pub fn kill_sockets(&self) {
        let _ = self.state.kill.send(());
    }

    /// Frames received on `channel` so far.
    pub fn received(&self, channel: &str) -> Vec<Outbound> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Successful handshakes on `channel` so far.
    pub fn connects(&self, channel: &str) -> usize {
        self.state.connects.lock().get(channel).copied().unwrap_or(0)
    }

    /// Sockets currently open on `channel`.
    pub fn open_sockets(&self, channel: &str) -> usize {
        self.state.open_sockets.lock().get(channel).copied().unwrap_or(0)
    }

    /// Waits until `channel` has received a frame matching `pred`.
    pub async fn wait_for_frame(&self, channel: &str, pred: impl Fn(&Outbound) -> bool) -> Outbound {
        let mut found = None;
        wait_until(|| {
            found = self.received(channel).into_iter().find(|e| pred(e));
            found.is_some()
        })
        .await;
        found.unwrap()
    }

    /// An API client signed in as `alice`.
    pub async fn signed_in_api(&self) -> Arc<HttpApi> {
        let api = HttpApi::new(self.api_base(), CredentialStore::new()).unwrap();
        api.login("alice", PASSWORD).await.unwrap();
        Arc::new(api)
    }

    /// Session settings with short timers suitable for tests.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.ws_base());
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: None,
            stability_threshold: Duration::from_secs(1),
            jitter: 0.0,
        };
        config.connect_timeout = Duration::from_secs(2);
        config.typing = TypingConfig {
            start_interval: Duration::from_secs(2),
            stop_delay: Duration::from_millis(150),
            peer_expiry: Duration::from_millis(300),
        };
        config
    }

    /// Waits until `channel` has seen at least `n` handshakes.
    pub async fn wait_for_connects(&self, channel: &str, n: usize) {
        wait_until(|| self.connects(channel) >= n).await;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls `cond` every 10ms, panicking after 5 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receives from `rx` until `pred` accepts an item, panicking after 5 seconds.
pub async fn recv_until<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let item = rx.recv().await.expect("event channel closed");
            if pred(&item) {
                return item;
            }
        }
    })
    .await
    .expect("expected event not received within 5s")
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh: String,
}

fn unauthorized(detail: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": detail}))).into_response()
}

async fn login(State(state): State<Arc<ServerState>>, Json(body): Json<LoginBody>) -> Response {
    if body.password != PASSWORD {
        return unauthorized("No active account found with the given credentials");
    }
    let access = state.access_token.lock().clone();
    Json(json!({
        "access": access,
        "refresh": REFRESH_TOKEN,
        "user": {"id": 1, "username": body.username},
    }))
    .into_response()
}

async fn register(Json(body): Json<Value>) -> Response {
    let username = body["username"].as_str().unwrap_or_default();
    if username == "alice" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"username": ["A user with that username already exists."]})),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({"id": 5, "username": username})),
    )
        .into_response()
}

async fn refresh(State(state): State<Arc<ServerState>>, Json(body): Json<RefreshBody>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock();
    tokio::time::sleep(delay).await;
    if !*state.refresh_valid.lock() || body.refresh != REFRESH_TOKEN {
        return unauthorized("Token is invalid or expired");
    }
    let n = state.minted.fetch_add(1, Ordering::SeqCst) + 1;
    let access = format!("access-{n}");
    state.access_token.lock().clone_from(&access);
    Json(json!({"access": access})).into_response()
}

async fn me(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    Json(state.me.clone()).into_response()
}

async fn users(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    Json(state.threads.lock().clone()).into_response()
}

async fn history(
    State(state): State<Arc<ServerState>>,
    Path(peer): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    let messages = state.history.lock().get(&peer).cloned().unwrap_or_else(|| json!([]));
    Json(messages).into_response()
}

async fn presence(
    State(state): State<Arc<ServerState>>,
    Path(_peer): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    state.presence_polls.fetch_add(1, Ordering::SeqCst);
    Json(state.presence.lock().clone()).into_response()
}

// ---------------------------------------------------------------------------
// Socket handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn inbox_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    upgrade(ws, query, state, "inbox".to_owned())
}

async fn presence_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    upgrade(ws, query, state, "presence".to_owned())
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    Path(peer): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    upgrade(ws, query, state, format!("chat/{peer}"))
}

fn upgrade(ws: WebSocketUpgrade, query: TokenQuery, state: Arc<ServerState>, channel: String) -> Response {
    let expected = state.access_token.lock().clone();
    if query.token.as_deref() != Some(expected.as_str()) {
        return StatusCode::FORBIDDEN.into_response();
    }
    // Subscribe before upgrading so frames pushed right after the handshake
    // are not lost.
    let push = state.push.subscribe();
    let kill = state.kill.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, channel, state, push, kill))
}

async fn serve_socket(
    mut socket: WebSocket,
    channel: String,
    state: Arc<ServerState>,
    mut push: broadcast::Receiver<Push>,
    mut kill: broadcast::Receiver<()>,
) {
    *state.connects.lock().entry(channel.clone()).or_default() += 1;
    *state.open_sockets.lock().entry(channel.clone()).or_default() += 1;

    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(event) = serde_json::from_str::<Outbound>(text.as_str()) {
                        state.record(&channel, event);
                    }
                }
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(pushed) = push.recv() => {
                if pushed.channel == channel
                    && socket.send(WsMessage::Text(pushed.frame.into())).await.is_err()
                {
                    break;
                }
            }
            _ = kill.recv() => break,
        }
    }

    if let Some(n) = state.open_sockets.lock().get_mut(&channel) {
        *n = n.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A message JSON object as the server serializes it.
pub fn message_json(id: i64, from: &str, to: &str, text: &str, status: &str) -> Value {
    json!({
        "id": id,
        "text": text,
        "created_at": "2024-05-01T12:00:00Z",
        "status": status,
        "sender": {"id": user_id(from), "username": from},
        "receiver": {"id": user_id(to), "username": to},
    })
}

fn user_id(username: &str) -> i64 {
    match username {
        "alice" => 1,
        "bob" => 2,
        "carol" => 3,
        _ => 99,
    }
}
