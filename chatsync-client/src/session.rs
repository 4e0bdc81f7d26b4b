//! Session store: the authenticated identity and its lifecycle.
//!
//! The identity drives the realtime connection. Whenever it is installed the
//! connection is opened for it; before it is cleared the connection is closed.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chatsync_core::{Credentials, Identity, ProfileUpdate, SignupRequest};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi, connection::ConnectionManager, error::ClientError, persist::IdentityStore,
};

/// Raises an in-flight flag for as long as the request future is alive.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionStore<A> {
    api: Arc<A>,
    connection: ConnectionManager,
    persistence: IdentityStore,
    identity: watch::Sender<Option<Identity>>,
    checking: AtomicBool,
    logging_in: AtomicBool,
    signing_up: AtomicBool,
    updating_profile: AtomicBool,
}

impl<A: ChatApi> SessionStore<A> {
    pub fn new(api: Arc<A>, connection: ConnectionManager, persistence: IdentityStore) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            api,
            connection,
            persistence,
            identity,
            checking: AtomicBool::new(true),
            logging_in: AtomicBool::new(false),
            signing_up: AtomicBool::new(false),
            updating_profile: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    pub fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    /// True until the first [`check_session`](Self::check_session) completes.
    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    pub fn is_logging_in(&self) -> bool {
        self.logging_in.load(Ordering::Acquire)
    }

    pub fn is_signing_up(&self) -> bool {
        self.signing_up.load(Ordering::Acquire)
    }

    pub fn is_updating_profile(&self) -> bool {
        self.updating_profile.load(Ordering::Acquire)
    }

    /// Identity left on disk by a previous run. For display only; the server has not
    /// confirmed it yet.
    pub fn persisted_identity(&self) -> Result<Option<Identity>, ClientError> {
        Ok(self.persistence.load()?)
    }

    /// Asks the server whether the cookie session is still valid.
    ///
    /// Any failure, including a transport error, reads as logged out.
    pub async fn check_session(&self) -> Option<Identity> {
        self.checking.store(true, Ordering::Release);
        let outcome = match self.api.check_auth().await {
            Ok(identity) => {
                info!(user_id = %identity.id, "session restored");
                self.install(identity.clone());
                Some(identity)
            }
            Err(err) => {
                debug!(status = ?err.status, "no valid session: {}", err.message);
                self.clear_local();
                None
            }
        };
        self.checking.store(false, Ordering::Release);
        outcome
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Identity, ClientError> {
        let _in_flight = InFlight::start(&self.logging_in);
        let identity = self
            .api
            .login(credentials)
            .await
            .map_err(ClientError::from_auth)?;
        info!(user_id = %identity.id, "logged in");
        self.install(identity.clone());
        Ok(identity)
    }

    pub async fn create_account(&self, request: &SignupRequest) -> Result<Identity, ClientError> {
        let _in_flight = InFlight::start(&self.signing_up);
        let identity = self
            .api
            .signup(request)
            .await
            .map_err(ClientError::from_auth)?;
        info!(user_id = %identity.id, "account created");
        self.install(identity.clone());
        Ok(identity)
    }

    /// Ends the session. The connection is closed and the identity cleared even if the
    /// server call fails; that failure is only logged.
    pub async fn logout(&self) {
        let remote = self.api.logout().await;
        self.clear_local();
        match remote {
            Ok(()) => info!("logged out"),
            Err(err) => {
                warn!(status = ?err.status, "logout request failed, local session cleared anyway: {}", err.message);
            }
        }
    }

    /// Replaces the identity with the server's updated record. On failure the current
    /// identity is left as it was.
    pub async fn update_identity(&self, update: &ProfileUpdate) -> Result<Identity, ClientError> {
        let current = self.identity().ok_or(ClientError::NotAuthenticated)?;
        if update.is_empty() {
            return Ok(current);
        }

        let _in_flight = InFlight::start(&self.updating_profile);
        let updated = self
            .api
            .update_profile(update)
            .await
            .map_err(ClientError::from_request)?;

        let replaced = self.identity.send_if_modified(|slot| match slot {
            Some(existing) if existing.id == updated.id => {
                *existing = updated.clone();
                true
            }
            _ => false,
        });
        if !replaced {
            debug!(user_id = %updated.id, "identity changed during profile update; result dropped");
            return Err(ClientError::NotAuthenticated);
        }
        self.persist(&updated);
        info!(user_id = %updated.id, "profile updated");
        Ok(updated)
    }

    fn install(&self, identity: Identity) {
        if let Some(previous) = self.connection.connected_user()
            && previous != identity.id
        {
            info!(previous = %previous, next = %identity.id, "switching identity");
            self.connection.close();
        }
        self.persist(&identity);
        self.identity.send_replace(Some(identity.clone()));
        self.connection.open(&identity);
    }

    fn clear_local(&self) {
        self.connection.close();
        self.identity.send_if_modified(|slot| slot.take().is_some());
        if let Err(err) = self.persistence.clear() {
            warn!("failed to remove persisted identity: {}", err);
        }
    }

    fn persist(&self, identity: &Identity) {
        if let Err(err) = self.persistence.save(identity) {
            warn!(user_id = %identity.id, "failed to persist identity: {}", err);
        }
    }
}
