//! Realtime connection manager.
//!
//! Owns at most one supervised WebSocket per identity. A single supervisor task per
//! connection connects, pumps push frames to registered handlers and reconnects with
//! capped exponential backoff, so there is never a second concurrent socket.
//!
//! Every connection is stamped with an epoch. `close` bumps the epoch before it
//! releases the socket; frames and state changes from an older epoch are discarded, so
//! a later `open` cannot double-deliver anything the previous socket received.
//! Delivery holds a read fence that `open` and `close` take exclusively, so once
//! `close` returns no handler is still working on a frame of the old socket.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chatsync_core::{EventKind, Identity, PushEvent, USER_ID_QUERY_PARAM, UserId, decode_event};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::lock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid realtime url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("handshake rejected with HTTP status {0}")]
    HandshakeRejected(u16),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection closed by server")]
    ClosedByServer,
    #[error("gave up after {0} failed reconnect attempts")]
    RetriesExhausted(u32),
}

impl TransportError {
    /// Fatal errors end the connection instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidUrl { .. }
                | TransportError::HandshakeRejected(_)
                | TransportError::RetriesExhausted(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub socket_url: String,
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// `None` retries for as long as the identity is present.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:8080/ws".to_owned(),
            connect_timeout: Duration::from_secs(12),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            max_reconnect_attempts: None,
        }
    }
}

/// Builds the handshake URL carrying the identity id as correlation token.
pub fn connect_url(socket_url: &str, user_id: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: socket_url.to_owned(),
        reason,
    };
    let mut url = Url::parse(socket_url).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if user_id.trim().is_empty() {
        return Err(invalid("empty user id".to_owned()));
    }
    url.query_pairs_mut()
        .append_pair(USER_ID_QUERY_PARAM, user_id);
    Ok(url)
}

/// Delay before reconnect attempt `attempt` (1-based), without jitter.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1_u32 << exponent).min(max)
}

fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerSlot {
    Event(EventKind),
    State,
    Error,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    events: HashMap<EventKind, Vec<(u64, EventHandler)>>,
    state: Vec<(u64, StateHandler)>,
    errors: Vec<(u64, ErrorHandler)>,
}

impl Listeners {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, slot: ListenerSlot, id: u64) {
        match slot {
            ListenerSlot::Event(kind) => {
                if let Some(handlers) = self.events.get_mut(&kind) {
                    handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            }
            ListenerSlot::State => self.state.retain(|(handler_id, _)| *handler_id != id),
            ListenerSlot::Error => self.errors.retain(|(handler_id, _)| *handler_id != id),
        }
    }

    fn contains(&self, slot: ListenerSlot, id: u64) -> bool {
        match slot {
            ListenerSlot::Event(kind) => self
                .events
                .get(&kind)
                .is_some_and(|handlers| handlers.iter().any(|(handler_id, _)| *handler_id == id)),
            ListenerSlot::State => self.state.iter().any(|(handler_id, _)| *handler_id == id),
            ListenerSlot::Error => self.errors.iter().any(|(handler_id, _)| *handler_id == id),
        }
    }

    fn event_handlers(&self, kind: EventKind) -> Vec<EventHandler> {
        self.events
            .get(&kind)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

/// Handle for a registered handler. Dropping it (or calling [`unsubscribe`]) detaches
/// the handler.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "dropping a Subscription detaches its handler"]
pub struct Subscription {
    id: u64,
    slot: ListenerSlot,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        self.listeners
            .upgrade()
            .is_some_and(|listeners| lock(&listeners).contains(self.slot, self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(self.slot, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .finish()
    }
}

struct ActiveConnection {
    user_id: UserId,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

struct Slot {
    epoch: u64,
    active: Option<ActiveConnection>,
}

struct Shared {
    config: ConnectionConfig,
    listeners: Arc<Mutex<Listeners>>,
    slot: Mutex<Slot>,
    delivery: RwLock<()>,
    state_tx: watch::Sender<ConnectionState>,
    handshakes: AtomicU64,
}

impl Shared {
    /// Applies `next` if `epoch` is still current. Handlers run after the locks are released.
    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        let changed = {
            let slot = lock(&self.slot);
            if slot.epoch != epoch {
                return false;
            }
            self.set_state(next)
        };
        if changed {
            self.notify_state();
        }
        true
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Handlers get the state current at call time, so a late notification can
    /// never replay an outdated transition.
    fn notify_state(&self) {
        let state = *self.state_tx.borrow();
        debug!(%state, "connection state changed");
        let handlers: Vec<StateHandler> = lock(&self.listeners)
            .state
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(state);
        }
    }

    /// Waits for in-flight deliveries to finish and keeps new ones out while held.
    fn fence(&self) -> RwLockWriteGuard<'_, ()> {
        self.delivery.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, epoch: u64, event: &PushEvent) -> bool {
        let _delivering = self.delivery.read().unwrap_or_else(PoisonError::into_inner);
        let handlers = {
            let slot = lock(&self.slot);
            if slot.epoch != epoch {
                return false;
            }
            lock(&self.listeners).event_handlers(event.kind())
        };
        for handler in handlers {
            handler(event);
        }
        true
    }

    fn report(&self, epoch: u64, error: &TransportError) {
        if lock(&self.slot).epoch != epoch {
            return;
        }
        warn!(%error, fatal = error.is_fatal(), "realtime transport error");
        let handlers: Vec<ErrorHandler> = lock(&self.listeners)
            .errors
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(error);
        }
    }
}

/// Supervises the realtime channel of the current identity.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("socket_url", &self.shared.config.socket_url)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                listeners: Arc::new(Mutex::new(Listeners::default())),
                slot: Mutex::new(Slot {
                    epoch: 0,
                    active: None,
                }),
                delivery: RwLock::new(()),
                state_tx,
                handshakes: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Identity the live connection is correlated to, if any.
    pub fn connected_user(&self) -> Option<UserId> {
        lock(&self.shared.slot)
            .active
            .as_ref()
            .map(|active| active.user_id.clone())
    }

    /// Number of completed handshakes over the manager's lifetime.
    pub fn handshake_count(&self) -> u64 {
        self.shared.handshakes.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.shared.listeners)
            .events
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Registers `handler` for pushes of `kind`. Handlers run on the connection task
    /// and must not call [`open`](Self::open) or [`close`](Self::close).
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners
            .events
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        self.subscription(id, ListenerSlot::Event(kind))
    }

    pub fn on_state<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.state.push((id, Arc::new(handler)));
        self.subscription(id, ListenerSlot::State)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.errors.push((id, Arc::new(handler)));
        self.subscription(id, ListenerSlot::Error)
    }

    fn subscription(&self, id: u64, slot: ListenerSlot) -> Subscription {
        Subscription {
            id,
            slot,
            listeners: Arc::downgrade(&self.shared.listeners),
        }
    }

    /// Starts a connection for `identity` unless one is already live.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, identity: &Identity) {
        let (epoch, changed) = {
            let _fence = self.shared.fence();
            let mut slot = lock(&self.shared.slot);
            if let Some(active) = &slot.active {
                if self.state() != ConnectionState::Disconnected {
                    if active.user_id == identity.id {
                        debug!(user_id = %identity.id, "connection already open");
                    } else {
                        warn!(
                            user_id = %identity.id,
                            current = %active.user_id,
                            "open ignored: connection belongs to another identity"
                        );
                    }
                    return;
                }
            }
            if let Some(stale) = slot.active.take() {
                stale.task.abort();
            }

            slot.epoch += 1;
            let epoch = slot.epoch;
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let task = tokio::spawn(supervise(
                Arc::downgrade(&self.shared),
                epoch,
                identity.id.clone(),
                shutdown_rx,
            ));
            slot.active = Some(ActiveConnection {
                user_id: identity.id.clone(),
                shutdown: Some(shutdown_tx),
                task,
            });
            let changed = self.shared.set_state(ConnectionState::Connecting);
            (epoch, changed)
        };

        info!(user_id = %identity.id, epoch, "opening realtime connection");
        if changed {
            self.shared.notify_state();
        }
    }

    /// Tears the connection down. Idempotent.
    ///
    /// Blocks until a push being handled for the old connection has been delivered.
    pub fn close(&self) {
        let (active, changed) = {
            let _fence = self.shared.fence();
            let mut slot = lock(&self.shared.slot);
            slot.epoch += 1;
            let active = slot.active.take();
            let changed = self.shared.set_state(ConnectionState::Disconnected);
            (active, changed)
        };

        if let Some(mut active) = active {
            if let Some(shutdown) = active.shutdown.take() {
                let _ = shutdown.send(());
            }
            info!(user_id = %active.user_id, "realtime connection closed");
        }
        if changed {
            self.shared.notify_state();
        }
    }

    #[cfg(test)]
    pub(crate) fn emit(&self, event: &PushEvent) {
        let epoch = lock(&self.shared.slot).epoch;
        self.shared.dispatch(epoch, event);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        let epoch = lock(&self.shared.slot).epoch;
        self.shared.transition(epoch, state);
    }
}

enum PumpExit {
    Shutdown,
    Fenced,
    Lost(TransportError),
}

async fn supervise(
    shared: Weak<Shared>,
    epoch: u64,
    user_id: UserId,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let Some(config) = shared.upgrade().map(|s| s.config.clone()) else {
        return;
    };

    let url = match connect_url(&config.socket_url, &user_id) {
        Ok(url) => url,
        Err(err) => {
            give_up(&shared, epoch, &err);
            return;
        }
    };

    let mut failures: u32 = 0;
    loop {
        if !with_shared(&shared, |s| s.transition(epoch, ConnectionState::Connecting)) {
            return;
        }

        info!(
            attempt = failures + 1,
            user_id = %user_id,
            server = %config.socket_url,
            "connecting"
        );
        let attempt = tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            result = timeout(config.connect_timeout, connect_async(url.as_str())) => result,
        };

        let failure = match attempt {
            Ok(Ok((stream, _response))) => {
                failures = 0;
                let Some(connected) = shared.upgrade() else {
                    return;
                };
                connected.handshakes.fetch_add(1, Ordering::Relaxed);
                if !connected.transition(epoch, ConnectionState::Connected) {
                    return;
                }
                drop(connected);
                info!(user_id = %user_id, "connected");

                match pump(&shared, epoch, stream, &mut shutdown_rx).await {
                    PumpExit::Shutdown | PumpExit::Fenced => return,
                    PumpExit::Lost(err) => err,
                }
            }
            Ok(Err(err)) => classify_connect_error(err),
            Err(_) => TransportError::ConnectTimeout(config.connect_timeout),
        };

        if failure.is_fatal() {
            give_up(&shared, epoch, &failure);
            return;
        }
        with_shared(&shared, |s| {
            s.report(epoch, &failure);
            true
        });

        failures = failures.saturating_add(1);
        if let Some(max) = config.max_reconnect_attempts
            && failures > max
        {
            give_up(&shared, epoch, &TransportError::RetriesExhausted(max));
            return;
        }

        // Leave Connected right away so presence is cleared before the retry delay.
        if !with_shared(&shared, |s| s.transition(epoch, ConnectionState::Connecting)) {
            return;
        }
        let delay = jittered(backoff_delay(
            config.backoff_base,
            config.backoff_max,
            failures,
        ));
        debug!(?delay, failures, "reconnecting after backoff");
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    shared: &Weak<Shared>,
    epoch: u64,
    stream: WsStream,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> PumpExit {
    let (mut write, mut read) = stream.split();

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut *shutdown_rx => {
                let _ = timeout(CLOSE_FRAME_TIMEOUT, write.send(Message::Close(None))).await;
                return PumpExit::Shutdown;
            }
            next = read.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => return PumpExit::Lost(TransportError::ConnectionLost(err.to_string())),
            None => return PumpExit::Lost(TransportError::ClosedByServer),
        };

        let frame = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(err) => {
                    warn!("dropping non-utf8 binary frame: {}", err);
                    continue;
                }
            },
            Message::Close(_) => return PumpExit::Lost(TransportError::ClosedByServer),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let event = match decode_event(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!("dropping undecodable push frame: {}", err);
                continue;
            }
        };

        if !with_shared(shared, |s| s.dispatch(epoch, &event)) {
            return PumpExit::Fenced;
        }
    }
}

fn classify_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) if response.status().is_client_error() => {
            TransportError::HandshakeRejected(response.status().as_u16())
        }
        tungstenite::Error::Url(err) => TransportError::InvalidUrl {
            url: String::new(),
            reason: err.to_string(),
        },
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

fn give_up(shared: &Weak<Shared>, epoch: u64, error: &TransportError) {
    with_shared(shared, |s| {
        s.report(epoch, error);
        s.transition(epoch, ConnectionState::Disconnected)
    });
}

/// Runs `f` against the manager if it is still alive; a dropped manager reads as fenced.
fn with_shared(shared: &Weak<Shared>, f: impl FnOnce(&Shared) -> bool) -> bool {
    shared.upgrade().is_some_and(|s| f(&s))
}
