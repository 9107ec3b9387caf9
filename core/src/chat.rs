use crate::channel::{ChannelError, HandlerId, RealtimeChannel};
use crate::models::{AvailableUser, ChatUser, ConversationSummary, Message, TypingUser};
use crate::protocol::{
    TypingEvent, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_MESSAGE_SENT, EVENT_NEW_MESSAGE, EVENT_USER_OFFLINE,
    EVENT_USER_ONLINE, EVENT_USER_TYPING,
};
use crate::transport::{ApiRequest, SessionTransport, TransportError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Entry {
    arrival: u64,
    message: Message,
}

/// Client-side view of conversations, messages, presence and typing state.
#[derive(Default)]
struct ChatState {
    conversations: Vec<ConversationSummary>,
    messages: HashMap<String, Vec<Entry>>,
    current: Option<String>,
    online: HashSet<String>,
    typing: HashMap<String, String>,
    users: Vec<ChatUser>,
    arrivals: u64,
    loading: u32,
    error: Option<String>,
}

impl ChatState {
    /// Append `message` under its counterpart. Returns false for an id that is
    /// already cached there.
    fn add_message(&mut self, self_id: &str, message: Message) -> bool {
        let key = message.counterpart(self_id).to_string();
        let entries = self.messages.entry(key.clone()).or_default();
        if entries.iter().any(|entry| entry.message.id == message.id) {
            return false;
        }
        self.arrivals += 1;
        let incoming = message.sender_id != self_id;
        let focused = self.current.as_deref() == Some(key.as_str());
        entries.push(Entry {
            arrival: self.arrivals,
            message: message.clone(),
        });

        if let Some(position) = self.conversations.iter().position(|c| c.user.id == key) {
            let mut summary = self.conversations.remove(position);
            if incoming && !focused && !message.is_read {
                summary.unread_count += 1;
            }
            summary.last_message = Some(message);
            self.conversations.insert(0, summary);
        }
        true
    }

    /// Swap the local copy `local_id` for the server-confirmed `confirmed`.
    fn confirm(&mut self, self_id: &str, local_id: &str, confirmed: Message) {
        let key = confirmed.counterpart(self_id).to_string();
        if let Some(summary) = self.summary_mut(&key) {
            if summary.last_message.as_ref().is_some_and(|m| m.id == local_id) {
                summary.last_message = Some(confirmed.clone());
            }
        }
        let entries = self.messages.entry(key).or_default();
        let already_cached = entries.iter().any(|e| e.message.id == confirmed.id);
        match entries.iter().position(|e| e.message.id == local_id) {
            Some(position) if already_cached => {
                entries.remove(position);
            }
            Some(position) => entries[position].message = confirmed,
            None if !already_cached => {
                self.add_message(self_id, confirmed);
            }
            None => {}
        }
    }

    /// Drop the unsent local copy `id`, putting back the summary preview it displaced.
    fn discard(&mut self, key: &str, id: &str, previous: Option<Message>) {
        if let Some(entries) = self.messages.get_mut(key) {
            entries.retain(|e| e.message.id != id);
        }
        if let Some(summary) = self.summary_mut(key) {
            if summary.last_message.as_ref().is_some_and(|m| m.id == id) {
                summary.last_message = previous;
            }
        }
    }

    fn summary_mut(&mut self, key: &str) -> Option<&mut ConversationSummary> {
        self.conversations.iter_mut().find(|c| c.user.id == key)
    }

    fn last_message(&self, key: &str) -> Option<Message> {
        self.conversations
            .iter()
            .find(|c| c.user.id == key)
            .and_then(|c| c.last_message.clone())
    }

    /// Install a fetched page. Messages that arrived after `started` and are
    /// missing from the page are kept, after the page.
    fn install_page(&mut self, key: &str, started: u64, page: Vec<Message>) {
        let fetched: HashSet<String> = page.iter().map(|m| m.id.clone()).collect();
        let mut merged: Vec<Entry> = page
            .into_iter()
            .map(|message| Entry {
                arrival: 0,
                message,
            })
            .collect();
        if let Some(previous) = self.messages.remove(key) {
            merged.extend(
                previous
                    .into_iter()
                    .filter(|e| e.arrival > started && !fetched.contains(&e.message.id)),
            );
        }
        self.messages.insert(key.to_string(), merged);
    }

    fn apply_typing(&mut self, event: TypingEvent) {
        if event.is_typing {
            self.typing.insert(event.user_id, event.user_name);
        } else {
            self.typing.remove(&event.user_id);
        }
    }

    fn set_online(&mut self, user_id: String) {
        self.online.insert(user_id);
    }

    fn set_offline(&mut self, user_id: &str) {
        self.online.remove(user_id);
        self.typing.remove(user_id);
    }

    fn reset_presence(&mut self) {
        self.online.clear();
        self.typing.clear();
    }

    fn messages_for(&self, key: &str) -> Vec<Message> {
        self.messages
            .get(key)
            .map(|entries| entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    receiver_id: &'a str,
    content: &'a str,
}

/// Reconciles REST history and realtime events into one conversation cache.
///
/// Cache entries are keyed by the counterpart of each message, derived from
/// its sender and receiver, so placement never depends on which conversation
/// happens to be focused.
#[derive(Clone)]
pub struct ChatStore {
    state: Arc<RwLock<ChatState>>,
    self_id: Arc<str>,
    transport: SessionTransport,
    channel: RealtimeChannel,
    bindings: Arc<Bindings>,
}

/// Channel handlers registered by one store. They are removed once the last
/// clone of the store is dropped.
struct Bindings {
    channel: RealtimeChannel,
    ids: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl Bindings {
    fn release(&self) {
        for (event, id) in self.ids.lock().drain(..) {
            self.channel.off(event, Some(id));
        }
    }
}

impl Drop for Bindings {
    fn drop(&mut self) {
        self.release();
    }
}

impl ChatStore {
    pub fn new(
        self_id: impl Into<String>,
        transport: SessionTransport,
        channel: RealtimeChannel,
    ) -> Self {
        let self_id: String = self_id.into();
        Self {
            state: Arc::new(RwLock::new(ChatState::default())),
            self_id: Arc::from(self_id),
            transport,
            bindings: Arc::new(Bindings {
                channel: channel.clone(),
                ids: Mutex::new(Vec::new()),
            }),
            channel,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    /// Route realtime events into this store. Calling it twice is harmless.
    ///
    /// The focused conversation is re-joined on every new connection.
    pub fn attach(&self) {
        let mut bindings = self.bindings.ids.lock();
        if !bindings.is_empty() {
            return;
        }
        let self_id = self.self_id.clone();
        let weak = Arc::downgrade(&self.state);

        let id = {
            let (weak, self_id) = (weak.clone(), self_id.clone());
            self.channel.on_new_message(move |message| {
                with_state(&weak, |state| {
                    state.add_message(&self_id, message);
                })
            })
        };
        bindings.push((EVENT_NEW_MESSAGE, id));

        let id = {
            let (weak, self_id) = (weak.clone(), self_id.clone());
            self.channel.on_message_sent(move |message| {
                with_state(&weak, |state| {
                    state.add_message(&self_id, message);
                })
            })
        };
        bindings.push((EVENT_MESSAGE_SENT, id));

        let id = {
            let weak = weak.clone();
            self.channel
                .on_user_typing(move |event| with_state(&weak, |state| state.apply_typing(event)))
        };
        bindings.push((EVENT_USER_TYPING, id));

        let id = {
            let weak = weak.clone();
            self.channel.on_user_online(move |event| {
                with_state(&weak, |state| state.set_online(event.user_id))
            })
        };
        bindings.push((EVENT_USER_ONLINE, id));

        let id = {
            let weak = weak.clone();
            self.channel.on_user_offline(move |event| {
                with_state(&weak, |state| state.set_offline(&event.user_id))
            })
        };
        bindings.push((EVENT_USER_OFFLINE, id));

        let id = {
            let (weak, channel) = (weak.clone(), self.channel.downgrade());
            self.channel.on_connect(move || {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let current = state.read().current.clone();
                if let (Some(current), Some(channel)) = (current, channel.upgrade()) {
                    log_emit(channel.join_conversation(current), "joinConversation");
                }
            })
        };
        bindings.push((EVENT_CONNECT, id));

        let id = self
            .channel
            .on_disconnect(move |_| with_state(&weak, ChatState::reset_presence));
        bindings.push((EVENT_DISCONNECT, id));
    }

    /// Stop receiving realtime events.
    pub fn detach(&self) {
        self.bindings.release();
    }

    pub async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, TransportError> {
        let result = self
            .tracked(self.transport.get::<Vec<ConversationSummary>>("/messages/conversations"))
            .await;
        let conversations = result?;
        self.state.write().conversations = conversations.clone();
        Ok(conversations)
    }

    pub async fn fetch_messages(&self, other_user_id: &str) -> Result<Vec<Message>, TransportError> {
        let started = self.state.read().arrivals;
        let page = self
            .tracked(
                self.transport
                    .get::<Vec<Message>>(&format!("/messages/{other_user_id}")),
            )
            .await?;
        let mut state = self.state.write();
        state.install_page(other_user_id, started, page);
        Ok(state.messages_for(other_user_id))
    }

    /// Send through the API, showing the message locally straight away.
    ///
    /// The local copy is replaced by the stored message once the server
    /// confirms it, or removed if the write fails. Blank content is ignored.
    pub async fn send_message(
        &self,
        receiver_id: &str,
        content: &str,
    ) -> Result<Option<Message>, TransportError> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let local = Message::local(self.self_id.as_ref(), receiver_id, content);
        let previous = {
            let mut state = self.state.write();
            let previous = state.last_message(receiver_id);
            state.add_message(&self.self_id, local.clone());
            previous
        };

        let body = SendMessageBody {
            receiver_id,
            content,
        };
        match self.transport.post::<Message, _>("/messages", &body).await {
            Ok(stored) => {
                self.state
                    .write()
                    .confirm(&self.self_id, &local.id, stored.clone());
                debug!(receiver = receiver_id, id = %stored.id, "message stored");
                Ok(Some(stored))
            }
            Err(err) => {
                let mut state = self.state.write();
                state.discard(receiver_id, &local.id, previous);
                state.error = Some(err.to_string());
                warn!(receiver = receiver_id, %err, "message could not be sent");
                Err(err)
            }
        }
    }

    /// Insert an inbound or echoed message. Returns false for a duplicate id.
    pub fn add_message(&self, message: Message) -> bool {
        self.state.write().add_message(&self.self_id, message)
    }

    /// Focus a conversation, moving the realtime room subscription with it.
    pub fn set_current_conversation(&self, other_user_id: Option<&str>) {
        let previous = {
            let mut state = self.state.write();
            if state.current.as_deref() == other_user_id {
                return;
            }
            std::mem::replace(&mut state.current, other_user_id.map(str::to_string))
        };
        if let Some(previous) = previous {
            log_emit(self.channel.leave_conversation(previous), "leaveConversation");
        }
        if let Some(next) = other_user_id {
            log_emit(self.channel.join_conversation(next), "joinConversation");
            info!(conversation = next, "conversation focused");
        }
    }

    pub fn current_conversation(&self) -> Option<String> {
        self.state.read().current.clone()
    }

    pub fn notify_typing(&self, receiver_id: &str, is_typing: bool) {
        log_emit(self.channel.set_typing(receiver_id, is_typing), "typing");
    }

    pub fn set_typing(&self, event: TypingEvent) {
        self.state.write().apply_typing(event);
    }

    pub fn set_user_online(&self, user_id: impl Into<String>) {
        self.state.write().set_online(user_id.into());
    }

    pub fn set_user_offline(&self, user_id: &str) {
        self.state.write().set_offline(user_id);
    }

    pub fn reset_presence(&self) {
        self.state.write().reset_presence();
    }

    pub async fn fetch_available_users(&self) -> Result<Vec<ChatUser>, TransportError> {
        let users = self
            .tracked(self.transport.get::<Vec<ChatUser>>("/messages/users"))
            .await?;
        self.state.write().users = users.clone();
        Ok(users)
    }

    /// Known users, each flagged with its live presence.
    pub fn available_users(&self) -> Vec<AvailableUser> {
        let state = self.state.read();
        state
            .users
            .iter()
            .filter(|user| user.id != *self.self_id)
            .map(|user| AvailableUser {
                user: user.clone(),
                is_online: state.online.contains(&user.id),
            })
            .collect()
    }

    /// Mark everything received from `other_user_id` as read, remotely and locally.
    pub async fn mark_as_read(&self, other_user_id: &str) -> Result<(), TransportError> {
        self.transport
            .request(ApiRequest::put(format!("/messages/{other_user_id}/read")))
            .await?;
        let mut state = self.state.write();
        if let Some(entries) = state.messages.get_mut(other_user_id) {
            for entry in entries
                .iter_mut()
                .filter(|e| e.message.sender_id == other_user_id)
            {
                entry.message.is_read = true;
            }
        }
        if let Some(summary) = state
            .conversations
            .iter_mut()
            .find(|c| c.user.id == other_user_id)
        {
            summary.unread_count = 0;
        }
        Ok(())
    }

    pub fn messages(&self, other_user_id: &str) -> Vec<Message> {
        self.state.read().messages_for(other_user_id)
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.state.read().conversations.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.state
            .read()
            .conversations
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.state.read().online.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut online: Vec<String> = self.state.read().online.iter().cloned().collect();
        online.sort();
        online
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        let mut typing: Vec<TypingUser> = self
            .state
            .read()
            .typing
            .iter()
            .map(|(user_id, user_name)| TypingUser {
                user_id: user_id.clone(),
                user_name: user_name.clone(),
            })
            .collect();
        typing.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        typing
    }

    pub fn is_loading(&self) -> bool {
        self.state.read().loading > 0
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn clear_error(&self) {
        self.state.write().error = None;
    }

    /// Forget everything, e.g. after signing out.
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = ChatState::default();
    }

    async fn tracked<T, F>(&self, request: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        {
            let mut state = self.state.write();
            state.loading += 1;
            state.error = None;
        }
        let result = request.await;
        let mut state = self.state.write();
        state.loading = state.loading.saturating_sub(1);
        if let Err(err) = &result {
            state.error = Some(err.to_string());
        }
        result
    }
}

fn with_state(state: &Weak<RwLock<ChatState>>, apply: impl FnOnce(&mut ChatState)) {
    if let Some(state) = state.upgrade() {
        apply(&mut state.write());
    }
}

fn log_emit(result: Result<(), ChannelError>, event: &str) {
    if let Err(err) = result {
        debug!(event, %err, "realtime emit skipped");
    }
}
