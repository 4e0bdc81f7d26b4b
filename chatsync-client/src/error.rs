use chatsync_core::CoreError;
use thiserror::Error;

use crate::{api::ApiError, connection::TransportError, persist::PersistError};

/// Failures surfaced to callers of the session and conversation stores.
///
/// Server-provided messages are carried unmodified so the UI can show them as-is.
/// Out-of-order delivery acks and duplicate optimistic rows are resolved inside the
/// stores and never show up here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    AuthenticationFailure(String),
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    RequestFailure(String),
    #[error("not logged in")]
    NotAuthenticated,
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error(transparent)]
    InvalidMessage(#[from] CoreError),
    #[error("session persistence failed: {0}")]
    Persistence(#[from] PersistError),
}

impl ClientError {
    /// Credential submissions: a 4xx rejection is the user's to fix.
    pub(crate) fn from_auth(err: ApiError) -> Self {
        if err.is_rejection() {
            ClientError::AuthenticationFailure(err.message)
        } else {
            ClientError::RequestFailure(err.message)
        }
    }

    pub(crate) fn from_request(err: ApiError) -> Self {
        if err.is_unauthorized() {
            ClientError::SessionExpired
        } else {
            ClientError::RequestFailure(err.message)
        }
    }
}
