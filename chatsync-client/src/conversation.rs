//! Message log of the currently selected conversation.
//!
//! Three sources mutate the log: history responses, the REST reply to an outgoing
//! message, and push events. Their arrival order is not guaranteed, so the log is kept
//! consistent by data rules instead:
//!
//! - a selection generation fences off responses for a conversation no longer shown,
//!   and is also bumped when the identity changes or clears;
//! - outgoing messages carry a client correlation id that identifies the optimistic
//!   row when either the REST reply or the server broadcast arrives;
//! - delivery state only ever moves forward.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chatsync_core::{
    DeliveryState, DeliveryUpdate, EventKind, Identity, Message, MessageBody, MessageId,
    MessageRecord, PushEvent, UserId, normalize_log, ordered_insert_position,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    api::ChatApi,
    connection::{ConnectionManager, Subscription},
    error::ClientError,
    lock,
};

/// Status updates held for messages that have not reached the log yet.
pub const MAX_PENDING_UPDATES: usize = 256;

#[derive(Debug, Default)]
struct ConversationState {
    /// Identity the selection and log belong to.
    owner: Option<UserId>,
    selected: Option<UserId>,
    generation: u64,
    log: Vec<Message>,
    loading: bool,
    pending_updates: HashMap<MessageId, DeliveryState>,
}

impl ConversationState {
    fn is_showing(&self, conversation_id: &str) -> bool {
        self.selected.as_deref() == Some(conversation_id)
    }

    fn begin_selection(&mut self, peer_id: &str) -> u64 {
        self.generation += 1;
        self.selected = Some(peer_id.to_owned());
        self.log.clear();
        self.pending_updates.clear();
        self.loading = true;
        self.generation
    }

    fn clear_selection(&mut self) -> bool {
        let had_selection = self.selected.is_some() || !self.log.is_empty();
        self.generation += 1;
        self.selected = None;
        self.log.clear();
        self.pending_updates.clear();
        self.loading = false;
        had_selection
    }

    /// Drops the selection when the identity differs from the one it was made under.
    fn follow_identity(&mut self, current: Option<&str>) -> bool {
        if self.owner.as_deref() == current {
            return false;
        }
        debug!(
            previous = ?self.owner,
            current = ?current,
            "identity changed; dropping open conversation"
        );
        self.owner = current.map(str::to_owned);
        self.clear_selection()
    }

    /// Installs fetched history, folding in whatever arrived while the fetch was out.
    fn install_history(&mut self, history: Vec<Message>) {
        let arrived_meanwhile = std::mem::take(&mut self.log);
        let mut log = normalize_log(history);
        for message in &mut log {
            if let Some(state) = self.pending_updates.remove(&message.id) {
                message.delivery_state.advance(state);
            }
        }
        self.log = log;
        for message in arrived_meanwhile {
            self.apply_incoming(message);
        }
        self.loading = false;
    }

    fn position_by_correlation(&self, correlation_id: &str) -> Option<usize> {
        self.log
            .iter()
            .position(|m| m.correlation_id.as_deref() == Some(correlation_id))
    }

    fn position_by_id(&self, id: &str) -> Option<usize> {
        self.log.iter().position(|m| m.id == id)
    }

    /// Adds or merges a message of the shown conversation. Returns whether the log changed.
    fn apply_incoming(&mut self, mut message: Message) -> bool {
        if !self.is_showing(&message.conversation_id) {
            return false;
        }

        let existing = message
            .correlation_id
            .as_deref()
            .and_then(|cid| self.position_by_correlation(cid))
            .or_else(|| self.position_by_id(&message.id));
        if let Some(position) = existing {
            return self.merge_at(position, message);
        }

        if let Some(state) = self.pending_updates.remove(&message.id) {
            message.delivery_state.advance(state);
        }
        let position = ordered_insert_position(&self.log, &message);
        self.log.insert(position, message);
        true
    }

    /// Folds `message` into the row at `position`, keeping that row's place in the log
    /// and dropping any other row that already carries the persisted id.
    fn merge_at(&mut self, position: usize, message: Message) -> bool {
        let before = self.log[position].clone();
        let duplicate = self
            .log
            .iter()
            .enumerate()
            .find(|(index, m)| *index != position && m.id == message.id)
            .map(|(index, _)| index);

        let mut merged = before.clone();
        merged.absorb(message);
        if let Some(index) = duplicate {
            let other = self.log[index].delivery_state;
            merged.delivery_state.advance(other);
            debug!(message_id = %merged.id, "collapsed duplicate row for reconciled message");
        }
        if let Some(state) = self.pending_updates.remove(&merged.id) {
            merged.delivery_state.advance(state);
        }

        let changed = merged != before || duplicate.is_some();
        self.log[position] = merged;
        if let Some(index) = duplicate {
            self.log.remove(index);
        }
        changed
    }

    fn apply_delivery(&mut self, update: &DeliveryUpdate) -> bool {
        if let Some(message) = self.log.iter_mut().find(|m| m.id == update.message_id) {
            let advanced = message.delivery_state.advance(update.delivery_state);
            if !advanced {
                trace!(
                    message_id = %update.message_id,
                    current = %message.delivery_state,
                    incoming = %update.delivery_state,
                    "ignoring stale delivery update"
                );
            }
            return advanced;
        }

        if self.selected.is_some() {
            let known = self.pending_updates.contains_key(&update.message_id);
            if known || self.pending_updates.len() < MAX_PENDING_UPDATES {
                self.pending_updates
                    .entry(update.message_id.clone())
                    .and_modify(|state| {
                        state.advance(update.delivery_state);
                    })
                    .or_insert(update.delivery_state);
            } else {
                debug!(message_id = %update.message_id, "pending delivery updates full; dropping");
            }
        }
        false
    }

    fn drop_pending_send(&mut self, correlation_id: &str) -> bool {
        let before = self.log.len();
        self.log
            .retain(|m| !(m.is_pending() && m.correlation_id.as_deref() == Some(correlation_id)));
        self.log.len() != before
    }
}

struct StoreInner {
    state: Mutex<ConversationState>,
    revision: watch::Sender<u64>,
    identity: watch::Receiver<Option<Identity>>,
}

impl StoreInner {
    /// Runs `f` under the state lock; `f` reports whether it changed anything visible.
    ///
    /// State left over from a previous identity is dropped first, so `f` only ever
    /// sees the current identity's conversation.
    fn modify<R>(&self, f: impl FnOnce(&mut ConversationState) -> (R, bool)) -> R {
        let current = self.identity.borrow().as_ref().map(|i| i.id.clone());
        let (result, changed) = {
            let mut state = lock(&self.state);
            let reset = state.follow_identity(current.as_deref());
            let (result, changed) = f(&mut state);
            (result, changed || reset)
        };
        if changed {
            self.revision.send_modify(|r| *r += 1);
        }
        result
    }

    fn read<R>(&self, f: impl FnOnce(&ConversationState) -> R) -> R {
        self.modify(|state| (f(state), false))
    }

    fn on_incoming(&self, record: &MessageRecord) {
        self.modify(|state| {
            let Some(local_id) = state.owner.as_deref() else {
                trace!(message_id = %record.id, "no identity; dropping pushed message");
                return ((), false);
            };
            let message = record.clone().into_message(local_id);
            if !state.is_showing(&message.conversation_id) {
                trace!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "dropping message for a conversation that is not open"
                );
                return ((), false);
            }
            ((), state.apply_incoming(message))
        });
    }

    fn on_delivery_update(&self, update: &DeliveryUpdate) {
        self.modify(|state| ((), state.apply_delivery(update)));
    }
}

struct MessageSubscriptions {
    _incoming: Subscription,
    _delivery: Subscription,
}

/// Owns the message log of the conversation with the currently selected peer.
pub struct MessageStore<A> {
    api: Arc<A>,
    connection: ConnectionManager,
    inner: Arc<StoreInner>,
    subscriptions: Mutex<Option<MessageSubscriptions>>,
}

impl<A: ChatApi> MessageStore<A> {
    pub fn new(
        api: Arc<A>,
        connection: ConnectionManager,
        identity: watch::Receiver<Option<Identity>>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            api,
            connection,
            inner: Arc::new(StoreInner {
                state: Mutex::new(ConversationState::default()),
                revision,
                identity,
            }),
            subscriptions: Mutex::new(None),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.read(|state| state.log.clone())
    }

    pub fn selected_peer(&self) -> Option<UserId> {
        self.inner.read(|state| state.selected.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read(|state| state.loading)
    }

    /// Bumps whenever the visible log changes.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscriptions).is_some()
    }

    /// Attaches the push handlers. Calling it again while attached does nothing.
    pub fn subscribe(&self) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.is_some() {
            return;
        }

        let incoming = {
            let inner = Arc::clone(&self.inner);
            self.connection.on(EventKind::IncomingMessage, move |event| {
                if let PushEvent::IncomingMessage(record) = event {
                    inner.on_incoming(record);
                }
            })
        };
        let delivery = {
            let inner = Arc::clone(&self.inner);
            self.connection
                .on(EventKind::MessageDeliveryUpdate, move |event| {
                    if let PushEvent::MessageDeliveryUpdate(update) = event {
                        inner.on_delivery_update(update);
                    }
                })
        };
        *subscriptions = Some(MessageSubscriptions {
            _incoming: incoming,
            _delivery: delivery,
        });
        debug!("message store subscribed");
    }

    /// Detaches the push handlers. No-op when not subscribed.
    pub fn unsubscribe(&self) {
        if lock(&self.subscriptions).take().is_some() {
            debug!("message store unsubscribed");
        }
    }

    pub fn clear_selection(&self) {
        self.inner.modify(|state| ((), state.clear_selection()));
    }

    /// Switches to `peer_id` and loads its history.
    ///
    /// If another conversation is selected before the fetch returns, the response is
    /// discarded and this call reports success. The same holds when the identity
    /// changes or clears while the fetch is out.
    pub async fn select_conversation(&self, peer_id: &str) -> Result<(), ClientError> {
        let (generation, local_id) = self
            .inner
            .modify(|state| match state.owner.clone() {
                Some(local_id) => (Some((state.begin_selection(peer_id), local_id)), true),
                None => (None, false),
            })
            .ok_or(ClientError::NotAuthenticated)?;
        debug!(peer_id, generation, "loading conversation history");

        let fetched = self.api.fetch_history(peer_id).await;
        match fetched {
            Ok(records) => {
                let history: Vec<Message> = records
                    .into_iter()
                    .map(|record| record.into_message(&local_id))
                    .filter(|message| message.conversation_id == peer_id)
                    .collect();
                let count = history.len();
                let installed = self.inner.modify(|state| {
                    if state.generation != generation {
                        return (false, false);
                    }
                    state.install_history(history);
                    (true, true)
                });
                if installed {
                    debug!(peer_id, count, "conversation history installed");
                } else {
                    debug!(peer_id, generation, "discarding superseded history response");
                }
                Ok(())
            }
            Err(err) => {
                let current = self.inner.modify(|state| {
                    if state.generation != generation {
                        return (false, false);
                    }
                    state.loading = false;
                    (true, true)
                });
                if !current {
                    debug!(peer_id, "ignoring failure of superseded history fetch");
                    return Ok(());
                }
                warn!(peer_id, status = ?err.status, "history fetch failed: {}", err.message);
                Err(ClientError::from_request(err))
            }
        }
    }

    /// Appends an optimistic `Sent` row right away, then persists through the REST layer
    /// and reconciles the row in place with the stored record.
    pub async fn send_message(&self, body: MessageBody) -> Result<Message, ClientError> {
        body.validate()?;
        let correlation_id = Uuid::new_v4().to_string();

        let (generation, peer_id, local_id) = self.inner.modify(|state| {
            let Some(local_id) = state.owner.clone() else {
                return (Err(ClientError::NotAuthenticated), false);
            };
            let Some(peer_id) = state.selected.clone() else {
                return (Err(ClientError::NoConversationSelected), false);
            };
            state.log.push(Message::optimistic(
                correlation_id.clone(),
                local_id.clone(),
                peer_id.clone(),
                body.clone(),
                Utc::now(),
            ));
            (Ok((state.generation, peer_id, local_id)), true)
        })?;
        debug!(peer_id = %peer_id, correlation_id = %correlation_id, "optimistic message appended");

        match self
            .api
            .send_message(&peer_id, &body, &correlation_id)
            .await
        {
            Ok(record) => {
                let mut persisted = record.into_message(&local_id);
                persisted
                    .correlation_id
                    .get_or_insert_with(|| correlation_id.clone());
                let reconciled = self.inner.modify(|state| {
                    if state.generation != generation {
                        return (None, false);
                    }
                    let changed = state.apply_incoming(persisted.clone());
                    let row = state
                        .position_by_correlation(&correlation_id)
                        .map(|index| state.log[index].clone());
                    (row, changed)
                });
                if reconciled.is_none() {
                    debug!(correlation_id = %correlation_id, "conversation changed before send completed");
                }
                Ok(reconciled.unwrap_or(persisted))
            }
            Err(err) => {
                self.inner.modify(|state| {
                    if state.generation != generation {
                        return ((), false);
                    }
                    ((), state.drop_pending_send(&correlation_id))
                });
                warn!(peer_id = %peer_id, status = ?err.status, "send failed: {}", err.message);
                Err(ClientError::from_request(err))
            }
        }
    }
}
