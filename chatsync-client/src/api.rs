//! REST collaborator: the request/response half of the chat backend.

use std::{future::Future, time::Duration};

use chatsync_core::{
    Credentials, Identity, MessageBody, MessageRecord, ProfileUpdate, SignupRequest,
};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned, de::IgnoredAny};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Error returned by the REST layer: the HTTP status when one was received and the
/// human-readable message the server attached (or a per-operation fallback).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApiError {
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status, Some(401 | 403))
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.status, Some(400 | 401 | 403 | 404 | 409 | 422))
    }
}

/// Operations the sync core consumes from the REST backend.
pub trait ChatApi: Send + Sync + 'static {
    fn check_auth(&self) -> impl Future<Output = Result<Identity, ApiError>> + Send;

    fn login(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Identity, ApiError>> + Send;

    fn signup(
        &self,
        request: &SignupRequest,
    ) -> impl Future<Output = Result<Identity, ApiError>> + Send;

    fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn update_profile(
        &self,
        update: &ProfileUpdate,
    ) -> impl Future<Output = Result<Identity, ApiError>> + Send;

    fn fetch_history(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<Vec<MessageRecord>, ApiError>> + Send;

    fn send_message(
        &self,
        peer_id: &str,
        body: &MessageBody,
        correlation_id: &str,
    ) -> impl Future<Output = Result<MessageRecord, ApiError>> + Send;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    #[serde(flatten)]
    body: &'a MessageBody,
    #[serde(rename = "clientMessageId")]
    correlation_id: &'a str,
}

/// [`ChatApi`] over HTTP with a cookie-backed session.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
}

impl HttpChatApi {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::new(
                None,
                format!("API base URL {base_url} cannot carry a path"),
            ));
        }
        let client = Client::builder()
            .cookie_store(true)
            .timeout(request_timeout)
            .build()
            .map_err(|err| ApiError::new(None, format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::new(None, "API base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        fallback: &str,
    ) -> Result<T, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|err| ApiError::new(None, format!("{fallback}: {err}")))?;

        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "api response");
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                ApiError::new(
                    Some(status.as_u16()),
                    format!("{fallback}: malformed response: {err}"),
                )
            });
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| fallback.to_owned());
        Err(ApiError::new(Some(status.as_u16()), message))
    }
}

impl ChatApi for HttpChatApi {
    async fn check_auth(&self) -> Result<Identity, ApiError> {
        let url = self.endpoint(&["auth", "check"])?;
        self.send_json(self.client.get(url), "Session check failed")
            .await
    }

    async fn login(&self, credentials: &Credentials) -> Result<Identity, ApiError> {
        let url = self.endpoint(&["auth", "login"])?;
        self.send_json(self.client.post(url).json(credentials), "Login failed")
            .await
    }

    async fn signup(&self, request: &SignupRequest) -> Result<Identity, ApiError> {
        let url = self.endpoint(&["auth", "signup"])?;
        self.send_json(self.client.post(url).json(request), "Signup failed")
            .await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["auth", "logout"])?;
        self.send_json::<IgnoredAny>(self.client.post(url), "Logout failed")
            .await
            .map(|_| ())
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<Identity, ApiError> {
        let url = self.endpoint(&["auth", "update-profile"])?;
        self.send_json(self.client.put(url).json(update), "Profile update failed")
            .await
    }

    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<MessageRecord>, ApiError> {
        let url = self.endpoint(&["messages", peer_id])?;
        self.send_json(self.client.get(url), "Failed to load messages")
            .await
    }

    async fn send_message(
        &self,
        peer_id: &str,
        body: &MessageBody,
        correlation_id: &str,
    ) -> Result<MessageRecord, ApiError> {
        let url = self.endpoint(&["messages", "send", peer_id])?;
        let payload = SendMessageRequest {
            body,
            correlation_id,
        };
        self.send_json(self.client.post(url).json(&payload), "Failed to send message")
            .await
    }
}
