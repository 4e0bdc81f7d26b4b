use std::{cmp::Ordering, collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const MAX_PUSH_FRAME_BYTES: usize = 1024 * 1024;
pub const MAX_MESSAGE_TEXT_BYTES: usize = 64 * 1024;
pub const USER_ID_QUERY_PARAM: &str = "userId";

pub const EVENT_ROSTER: &str = "getOnlineUsers";
pub const EVENT_NEW_MESSAGE: &str = "newMessage";
pub const EVENT_STATUS_UPDATE: &str = "messageStatusUpdate";

pub type UserId = String;
pub type MessageId = String;
pub type ConversationId = String;
pub type CorrelationId = String;

/// The authenticated user record for the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(rename = "fullName")]
    pub display_name: String,
    #[serde(
        rename = "profilePic",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignupRequest {
    #[serde(rename = "fullName")]
    pub full_name: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for SignupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupRequest")
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Partial identity update. `None` fields are left untouched by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(rename = "fullName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "profilePic", default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.avatar_ref.is_none()
    }
}

/// Per-message delivery progress. Ordered `Sent < Delivered < Read`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// Normalises the legacy `delivered` / `read` flag pair. `read` implies delivered.
    pub fn from_flags(delivered: bool, read: bool) -> Self {
        match (delivered, read) {
            (_, true) => DeliveryState::Read,
            (true, false) => DeliveryState::Delivered,
            (false, false) => DeliveryState::Sent,
        }
    }

    /// Moves to `incoming` only if it is strictly further along. Returns whether it moved.
    pub fn advance(&mut self, incoming: DeliveryState) -> bool {
        if incoming > *self {
            *self = incoming;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn image(image_ref: impl Into<String>) -> Self {
        Self {
            text: None,
            image: Some(image_ref.into()),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_image = self.image.as_deref().is_some_and(|i| !i.trim().is_empty());
        if !has_text && !has_image {
            return Err(CoreError::EmptyMessageBody);
        }
        if self
            .text
            .as_deref()
            .is_some_and(|t| t.len() > MAX_MESSAGE_TEXT_BYTES)
        {
            return Err(CoreError::MessageTooLarge {
                max: MAX_MESSAGE_TEXT_BYTES,
            });
        }
        Ok(())
    }
}

/// Message as the server sends it, both in history responses and in `newMessage` pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_state: Option<DeliveryState>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read: bool,
    #[serde(
        rename = "clientMessageId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
}

impl MessageRecord {
    pub fn delivery_state(&self) -> DeliveryState {
        self.delivery_state
            .unwrap_or_default()
            .max(DeliveryState::from_flags(self.delivered, self.read))
    }

    /// Converts into the local model. The conversation is keyed by the peer of `local_user_id`.
    pub fn into_message(self, local_user_id: &str) -> Message {
        let delivery_state = self.delivery_state();
        let conversation_id = if self.sender_id == local_user_id {
            self.receiver_id.clone()
        } else {
            self.sender_id.clone()
        };
        Message {
            id: self.id,
            conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body,
            created_at: self.created_at,
            delivery_state,
            correlation_id: self.correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    /// Local placeholder for an outgoing message. Its id is the correlation id until
    /// the server assigns one.
    pub fn optimistic(
        correlation_id: CorrelationId,
        sender_id: UserId,
        receiver_id: UserId,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: correlation_id.clone(),
            conversation_id: receiver_id.clone(),
            sender_id,
            receiver_id,
            body,
            created_at,
            delivery_state: DeliveryState::Sent,
            correlation_id: Some(correlation_id),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.correlation_id.as_deref() == Some(self.id.as_str())
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Takes over the server's version of this message without regressing delivery state
    /// or forgetting the correlation id.
    pub fn absorb(&mut self, persisted: Message) {
        let delivery_state = self.delivery_state.max(persisted.delivery_state);
        let correlation_id = persisted.correlation_id.or_else(|| self.correlation_id.take());
        *self = Message {
            delivery_state,
            correlation_id,
            ..persisted
        };
    }
}

/// Log ordering: `created_at` ascending, ties broken by `id` ascending.
pub fn log_order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sorts a freshly fetched history and collapses duplicate ids, keeping the furthest
/// delivery state seen for each id.
pub fn normalize_log(messages: Vec<Message>) -> Vec<Message> {
    let mut by_id: HashMap<MessageId, Message> = HashMap::with_capacity(messages.len());
    for message in messages {
        match by_id.get_mut(&message.id) {
            Some(existing) => existing.absorb(message),
            None => {
                by_id.insert(message.id.clone(), message);
            }
        }
    }
    let mut log: Vec<Message> = by_id.into_values().collect();
    log.sort_by(log_order);
    log
}

/// Index at which `message` keeps the log ordered: after the last entry that does not
/// sort after it. Appends in the common case of a newer message.
pub fn ordered_insert_position(log: &[Message], message: &Message) -> usize {
    log.iter()
        .rposition(|existing| log_order(existing, message) != Ordering::Greater)
        .map_or(0, |index| index + 1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "DeliveryUpdateWire")]
pub struct DeliveryUpdate {
    #[serde(rename = "id")]
    pub message_id: MessageId,
    #[serde(rename = "deliveryState")]
    pub delivery_state: DeliveryState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryUpdateWire {
    #[serde(alias = "_id", alias = "messageId")]
    id: MessageId,
    #[serde(default)]
    delivery_state: Option<DeliveryState>,
    #[serde(default)]
    delivered: bool,
    #[serde(default)]
    read: bool,
}

impl From<DeliveryUpdateWire> for DeliveryUpdate {
    fn from(wire: DeliveryUpdateWire) -> Self {
        Self {
            message_id: wire.id,
            delivery_state: wire
                .delivery_state
                .unwrap_or_default()
                .max(DeliveryState::from_flags(wire.delivered, wire.read)),
        }
    }
}

/// Server-pushed realtime events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    #[serde(rename = "getOnlineUsers")]
    Roster(Vec<UserId>),
    #[serde(rename = "newMessage")]
    IncomingMessage(MessageRecord),
    #[serde(rename = "messageStatusUpdate")]
    MessageDeliveryUpdate(DeliveryUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Roster,
    MessageDeliveryUpdate,
    IncomingMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::Roster,
        EventKind::MessageDeliveryUpdate,
        EventKind::IncomingMessage,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Roster => EVENT_ROSTER,
            EventKind::MessageDeliveryUpdate => EVENT_STATUS_UPDATE,
            EventKind::IncomingMessage => EVENT_NEW_MESSAGE,
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == name)
    }
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::Roster(_) => EventKind::Roster,
            PushEvent::IncomingMessage(_) => EventKind::IncomingMessage,
            PushEvent::MessageDeliveryUpdate(_) => EventKind::MessageDeliveryUpdate,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("message must carry text or an image")]
    EmptyMessageBody,
    #[error("message text exceeds {max} bytes")]
    MessageTooLarge { max: usize },
    #[error("push frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown push event {0:?}")]
    UnknownEvent(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub fn encode_event(event: &PushEvent) -> Result<String, CoreError> {
    serde_json::to_string(event).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_event(frame: &str) -> Result<PushEvent, CoreError> {
    if frame.len() > MAX_PUSH_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame.len(),
            max: MAX_PUSH_FRAME_BYTES,
        });
    }

    let raw: RawFrame =
        serde_json::from_str(frame).map_err(|err| CoreError::Serialization(err.to_string()))?;
    let kind = EventKind::from_wire_name(&raw.event).ok_or(CoreError::UnknownEvent(raw.event))?;
    let event = match kind {
        EventKind::Roster => PushEvent::Roster(decode_payload(raw.data)?),
        EventKind::IncomingMessage => PushEvent::IncomingMessage(decode_payload(raw.data)?),
        EventKind::MessageDeliveryUpdate => {
            PushEvent::MessageDeliveryUpdate(decode_payload(raw.data)?)
        }
    };
    Ok(event)
}

fn decode_payload<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(data).map_err(|err| CoreError::Serialization(err.to_string()))
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, second).unwrap()
    }

    fn message(id: &str, second: u32, state: DeliveryState) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "peer".to_owned(),
            sender_id: "peer".to_owned(),
            receiver_id: "me".to_owned(),
            body: MessageBody::text(format!("body of {id}")),
            created_at: at(second),
            delivery_state: state,
            correlation_id: None,
        }
    }

    fn permutations(items: &[DeliveryState]) -> Vec<Vec<DeliveryState>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for index in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(index);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn delivery_state_converges_to_maximum_in_any_order() {
        let updates = [
            DeliveryState::Delivered,
            DeliveryState::Read,
            DeliveryState::Delivered,
            DeliveryState::Sent,
        ];
        for order in permutations(&updates) {
            let mut state = DeliveryState::Sent;
            for update in &order {
                state.advance(*update);
            }
            assert_eq!(state, DeliveryState::Read, "order {order:?}");
        }
    }

    #[test]
    fn advance_reports_only_real_transitions() {
        let mut state = DeliveryState::Delivered;
        assert!(!state.advance(DeliveryState::Delivered));
        assert!(!state.advance(DeliveryState::Sent));
        assert!(state.advance(DeliveryState::Read));
        assert_eq!(state, DeliveryState::Read);
    }

    #[test]
    fn legacy_flags_never_yield_read_without_delivered() {
        assert_eq!(DeliveryState::from_flags(false, true), DeliveryState::Read);
        assert_eq!(
            DeliveryState::from_flags(true, false),
            DeliveryState::Delivered
        );
        assert_eq!(DeliveryState::from_flags(false, false), DeliveryState::Sent);
    }

    #[test]
    fn conversation_id_is_the_peer() {
        let json = r#"{
            "_id": "m1",
            "senderId": "me",
            "receiverId": "alice",
            "text": "hello",
            "createdAt": "2025-01-02T03:04:05.000Z",
            "delivered": true
        }"#;
        let record: MessageRecord = serde_json::from_str(json).unwrap();
        let outgoing = record.clone().into_message("me");
        assert_eq!(outgoing.conversation_id, "alice");
        assert_eq!(outgoing.delivery_state, DeliveryState::Delivered);

        let incoming = record.into_message("alice");
        assert_eq!(incoming.conversation_id, "me");
    }

    #[test]
    fn log_order_breaks_timestamp_ties_by_id() {
        let log = normalize_log(vec![
            message("b", 5, DeliveryState::Sent),
            message("c", 1, DeliveryState::Sent),
            message("a", 5, DeliveryState::Sent),
        ]);
        let ids: Vec<_> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn normalize_log_collapses_duplicates_keeping_furthest_state() {
        let log = normalize_log(vec![
            message("m1", 1, DeliveryState::Read),
            message("m2", 2, DeliveryState::Sent),
            message("m1", 1, DeliveryState::Delivered),
        ]);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].id, "m1");
        assert_eq!(log[0].delivery_state, DeliveryState::Read);
    }

    #[test]
    fn insert_position_appends_newer_and_slots_older() {
        let log = vec![
            message("a", 1, DeliveryState::Sent),
            message("c", 3, DeliveryState::Sent),
        ];
        assert_eq!(
            ordered_insert_position(&log, &message("d", 4, DeliveryState::Sent)),
            2
        );
        assert_eq!(
            ordered_insert_position(&log, &message("b", 2, DeliveryState::Sent)),
            1
        );
        assert_eq!(
            ordered_insert_position(&log, &message("0", 0, DeliveryState::Sent)),
            0
        );
        assert_eq!(ordered_insert_position(&[], &message("x", 0, DeliveryState::Sent)), 0);
    }

    #[test]
    fn absorb_keeps_correlation_and_highest_state() {
        let mut optimistic = Message::optimistic(
            "cid-1".to_owned(),
            "me".to_owned(),
            "alice".to_owned(),
            MessageBody::text("hi"),
            at(9),
        );
        optimistic.delivery_state = DeliveryState::Delivered;
        assert!(optimistic.is_pending());

        let mut persisted = message("srv-1", 8, DeliveryState::Sent);
        persisted.correlation_id = None;
        optimistic.absorb(persisted);

        assert_eq!(optimistic.id, "srv-1");
        assert_eq!(optimistic.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(optimistic.delivery_state, DeliveryState::Delivered);
        assert!(!optimistic.is_pending());
    }

    #[test]
    fn empty_body_is_rejected() {
        assert_eq!(
            MessageBody::text("   ").validate(),
            Err(CoreError::EmptyMessageBody)
        );
        assert_eq!(
            MessageBody::default().validate(),
            Err(CoreError::EmptyMessageBody)
        );
        assert!(MessageBody::image("https://cdn.example/p.png").validate().is_ok());
        let huge = MessageBody::text("x".repeat(MAX_MESSAGE_TEXT_BYTES + 1));
        assert!(matches!(
            huge.validate(),
            Err(CoreError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn decodes_server_push_frames() {
        let roster = decode_event(r#"{"event":"getOnlineUsers","data":["u1","u2"]}"#).unwrap();
        assert_eq!(roster, PushEvent::Roster(vec!["u1".into(), "u2".into()]));
        assert_eq!(roster.kind(), EventKind::Roster);

        let status =
            decode_event(r#"{"event":"messageStatusUpdate","data":{"_id":"m1","read":true}}"#)
                .unwrap();
        assert_eq!(
            status,
            PushEvent::MessageDeliveryUpdate(DeliveryUpdate {
                message_id: "m1".into(),
                delivery_state: DeliveryState::Read,
            })
        );

        let incoming = decode_event(
            r#"{"event":"newMessage","data":{"_id":"m2","senderId":"u1","receiverId":"me",
                "image":"https://cdn.example/cat.png","createdAt":"2025-01-02T03:04:05Z",
                "clientMessageId":"cid-7"}}"#,
        )
        .unwrap();
        match incoming {
            PushEvent::IncomingMessage(record) => {
                assert_eq!(record.body.image.as_deref(), Some("https://cdn.example/cat.png"));
                assert_eq!(record.body.text, None);
                assert_eq!(record.correlation_id.as_deref(), Some("cid-7"));
                assert_eq!(record.delivery_state(), DeliveryState::Sent);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn encoded_events_use_server_event_names() {
        let frame = encode_event(&PushEvent::MessageDeliveryUpdate(DeliveryUpdate {
            message_id: "m1".into(),
            delivery_state: DeliveryState::Delivered,
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], EVENT_STATUS_UPDATE);
        assert_eq!(value["data"]["deliveryState"], "delivered");
        assert!(decode_event(&frame).is_ok());
    }

    #[test]
    fn rejects_unknown_and_oversized_frames() {
        let err = decode_event(r#"{"event":"typing","data":{}}"#).unwrap_err();
        assert_eq!(err, CoreError::UnknownEvent("typing".into()));

        let oversized = format!(
            r#"{{"event":"getOnlineUsers","data":["{}"]}}"#,
            "u".repeat(MAX_PUSH_FRAME_BYTES)
        );
        assert!(matches!(
            decode_event(&oversized),
            Err(CoreError::FrameTooLarge { .. })
        ));

        assert!(matches!(
            decode_event("not json"),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn identity_treats_blank_avatar_as_absent() {
        let json = r#"{"_id":"u1","fullName":"Ada","email":"ada@example.com",
            "profilePic":"","createdAt":"2024-06-01T10:00:00.000Z"}"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.avatar_ref, None);
        assert_eq!(identity.display_name, "Ada");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            email: "ada@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
