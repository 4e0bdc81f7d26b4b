//! Reference push relay for chatsync clients.
//!
//! Each user holds one WebSocket at `/ws?userId=<id>`. The relay keeps the online
//! roster, broadcasts it on every join and leave, and forwards targeted
//! `newMessage` / `messageStatusUpdate` pushes handed to it over HTTP or through
//! [`AppState`].

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chatsync_core::{MAX_PUSH_FRAME_BYTES, PushEvent, UserId, encode_event};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

/// Pongs queued by the read half are only flushed when the write half sends, so an
/// idle socket needs periodic writes to stay alive behind a proxy.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct RelayState {
    users: HashMap<UserId, Connection>,
}

impl RelayState {
    fn roster(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.keys().cloned().collect();
        users.sort();
        users
    }

    fn recipients(&self) -> Vec<mpsc::UnboundedSender<Message>> {
        self.users.values().map(|conn| conn.tx.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    next_connection_id: Arc<AtomicU64>,
    accepted: Arc<AtomicU64>,
    keepalive: Duration,
}

impl Default for AppState {
    fn default() -> Self {
        Self::with_keepalive(DEFAULT_KEEPALIVE_INTERVAL)
    }
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pings idle sockets every `interval`. A zero interval falls back to the default.
    #[must_use]
    pub fn with_keepalive(interval: Duration) -> Self {
        Self {
            inner: Arc::default(),
            next_connection_id: Arc::default(),
            accepted: Arc::default(),
            keepalive: if interval.is_zero() {
                DEFAULT_KEEPALIVE_INTERVAL
            } else {
                interval
            },
        }
    }

    /// Users with a live socket, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.read().await.roster()
    }

    /// Sockets accepted over the relay's lifetime.
    pub fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Sends `event` to `user_id`. Returns false when the user is offline.
    pub async fn push_to(&self, user_id: &str, event: &PushEvent) -> bool {
        let Some(tx) = self
            .inner
            .read()
            .await
            .users
            .get(user_id)
            .map(|conn| conn.tx.clone())
        else {
            debug!(user_id, event = event.kind().wire_name(), "push target offline");
            return false;
        };
        match encode_event(event) {
            Ok(frame) => tx.send(Message::Text(frame.into())).is_ok(),
            Err(err) => {
                error!("failed to encode push event: {}", err);
                false
            }
        }
    }

    /// Sends `event` to every connected user.
    pub async fn broadcast(&self, event: &PushEvent) {
        let recipients = self.inner.read().await.recipients();
        send_all(recipients, event);
    }

    /// Drops `user_id`'s socket with a close frame, as a server-side disconnect would.
    pub async fn disconnect(&self, user_id: &str) -> bool {
        let mut relay = self.inner.write().await;
        let Some(conn) = relay.users.remove(user_id) else {
            return false;
        };
        let roster = relay.roster();
        let recipients = relay.recipients();
        drop(relay);

        let _ = conn.tx.send(Message::Close(None));
        info!(user_id, "user disconnected by relay");
        send_all(recipients, &PushEvent::Roster(roster));
        true
    }

    async fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let mut relay = self.inner.write().await;
        if let Some(replaced) = relay
            .users
            .insert(user_id.to_owned(), Connection { id, tx })
        {
            warn!(user_id, "replacing existing socket for user");
            let _ = replaced.tx.send(Message::Close(None));
        }
        let roster = relay.roster();
        let recipients = relay.recipients();
        drop(relay);

        send_all(recipients, &PushEvent::Roster(roster));
        id
    }

    async fn unregister(&self, user_id: &str, connection_id: u64) {
        let mut relay = self.inner.write().await;
        let current = relay
            .users
            .get(user_id)
            .is_some_and(|conn| conn.id == connection_id);
        if !current {
            return;
        }
        relay.users.remove(user_id);
        let roster = relay.roster();
        let recipients = relay.recipients();
        drop(relay);

        send_all(recipients, &PushEvent::Roster(roster));
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/push/{user_id}", post(push_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "online": state.online_users().await.len(),
    }))
}

async fn push_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(event): Json<PushEvent>,
) -> StatusCode {
    if state.push_to(&user_id, &event).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = params
        .user_id
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "userId query parameter is required").into_response();
    };

    ws.max_frame_size(MAX_PUSH_FRAME_BYTES)
        .max_message_size(MAX_PUSH_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket, user_id))
}

async fn handle_socket(state: AppState, socket: WebSocket, user_id: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let keepalive = state.keepalive;

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(keepalive);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(message) = msg else { break };
                    let closing = matches!(message, Message::Close(_));
                    if ws_sender.send(message).await.is_err() || closing {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let connection_id = state.register(&user_id, outbound_tx).await;
    info!(user_id = %user_id, connection_id, "user connected");

    while let Some(next_message) = ws_receiver.next().await {
        match next_message {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!(user_id = %user_id, len = text.len(), "ignoring client text frame");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(user_id = %user_id, "websocket receive error: {}", err);
                break;
            }
        }
    }

    state.unregister(&user_id, connection_id).await;
    send_task.abort();
    info!(user_id = %user_id, connection_id, "user disconnected");
}

fn send_all(recipients: Vec<mpsc::UnboundedSender<Message>>, event: &PushEvent) {
    let frame = match encode_event(event) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to encode push event: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Text(frame.clone().into()));
    }
}
