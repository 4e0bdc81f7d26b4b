//! Client session and realtime synchronization core for chatsync.
//!
//! [`ChatClient`] wires the four stores together over one [`ConnectionManager`]:
//! the session store drives the connection, and the connection's push events feed
//! presence and the open conversation.

pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod persist;
pub mod presence;
pub mod session;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::timeout;

pub use api::{ApiError, ChatApi, HttpChatApi};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, TransportError};
pub use conversation::MessageStore;
pub use error::ClientError;
pub use persist::IdentityStore;
pub use presence::PresenceTracker;
pub use session::SessionStore;

/// Store locks guard plain data; a panicked handler must not wedge the client.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChatClient<A> {
    connection: ConnectionManager,
    session: SessionStore<A>,
    presence: PresenceTracker,
    messages: MessageStore<A>,
}

impl<A: ChatApi> ChatClient<A> {
    pub fn new(api: A, connection: ConnectionConfig, persistence: IdentityStore) -> Self {
        let api = Arc::new(api);
        let connection = ConnectionManager::new(connection);
        let session = SessionStore::new(Arc::clone(&api), connection.clone(), persistence);
        let presence = PresenceTracker::new(&connection);
        let messages = MessageStore::new(api, connection.clone(), session.watch_identity());
        Self {
            connection,
            session,
            presence,
            messages,
        }
    }

    pub fn session(&self) -> &SessionStore<A> {
        &self.session
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn messages(&self) -> &MessageStore<A> {
        &self.messages
    }

    /// Detaches the message store and drops the open conversation before the session
    /// is torn down. Call `messages().subscribe()` again after the next login.
    pub async fn logout(&self) {
        self.messages.unsubscribe();
        self.messages.clear_selection();
        self.session.logout().await;
    }

    /// Waits until the connection reaches `target`.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        within: Duration,
    ) -> Result<(), ClientError> {
        let mut state = self.connection.watch_state();
        let reached = timeout(within, async move {
            state.wait_for(|current| *current == target).await.is_ok()
        })
        .await;
        match reached {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(TransportError::ConnectTimeout(within).into()),
        }
    }
}
