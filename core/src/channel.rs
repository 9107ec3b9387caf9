use crate::connector::{Connector, LinkEvent};
use crate::models::Message;
use crate::protocol::{
    Frame, InboundEvent, OfflineEvent, OnlineEvent, OutboundEvent, TypingEvent, EVENT_CONNECT,
    EVENT_CONNECT_ERROR, EVENT_DISCONNECT, EVENT_MESSAGE_SENT, EVENT_NEW_MESSAGE,
    EVENT_USER_OFFLINE, EVENT_USER_ONLINE, EVENT_USER_TYPING, SERVER_EVENTS,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("realtime connection failed: {0}")]
    Connect(String),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("realtime frame could not be encoded: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Identifies one established link; a reconnect always yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub connection: Option<ConnectionId>,
    pub last_error: Option<String>,
}

impl ChannelStatus {
    fn disconnected(last_error: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection: None,
            last_error,
        }
    }
}

pub type HandlerId = u64;
type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct ActiveLink {
    id: ConnectionId,
    token: String,
    outbound: UnboundedSender<Frame>,
    pump: JoinHandle<()>,
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    link: Mutex<Option<ActiveLink>>,
    connecting: tokio::sync::Mutex<()>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
    next_connection: AtomicU64,
    status: watch::Sender<ChannelStatus>,
}

/// The single realtime connection of a session.
///
/// Handlers may be registered at any time and survive reconnects. Lifecycle
/// events (`connect`, `disconnect`, `connect_error`) go through the same
/// registry as server events.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

/// Non-owning handle to a [`RealtimeChannel`], for handlers registered on
/// the channel they act on.
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<RealtimeChannel> {
        self.inner.upgrade().map(|inner| RealtimeChannel { inner })
    }
}

impl RealtimeChannel {
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel(ChannelStatus::disconnected(None));
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                link: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                handlers: RwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                next_connection: AtomicU64::new(1),
                status,
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.link.lock().as_ref().map(|link| link.id)
    }

    /// Connect with `token`, or hand back the live connection if there is one.
    ///
    /// Concurrent callers are serialized; the second one observes the link
    /// established by the first.
    pub async fn connect(&self, token: &str) -> Result<ConnectionId, ChannelError> {
        let _serialized = self.inner.connecting.lock().await;
        if let Some((id, held)) = self.held_link() {
            if held != token {
                debug!("reusing realtime connection opened with an earlier token");
            }
            return Ok(id);
        }

        self.inner.status.send_replace(ChannelStatus {
            state: ConnectionState::Connecting,
            connection: None,
            last_error: None,
        });
        info!("connecting realtime channel");

        let link = match self.inner.connector.connect(token).await {
            Ok(link) => link,
            Err(err) => {
                warn!(%err, "realtime connection failed");
                self.inner
                    .status
                    .send_replace(ChannelStatus::disconnected(Some(err.to_string())));
                self.inner
                    .dispatch(EVENT_CONNECT_ERROR, &json!({ "message": err.to_string() }));
                return Err(err);
            }
        };

        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        {
            // The pump needs this lock to retire the link, so it cannot
            // observe a half-registered connection.
            let mut slot = self.inner.link.lock();
            let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), id, link.inbound));
            *slot = Some(ActiveLink {
                id,
                token: token.to_string(),
                outbound: link.outbound,
                pump,
            });
            self.inner.status.send_replace(ChannelStatus {
                state: ConnectionState::Connected,
                connection: Some(id),
                last_error: None,
            });
        }
        info!(connection = id.0, "realtime channel connected");
        Ok(id)
    }

    /// Tear down the live connection. Does nothing when already disconnected.
    pub fn disconnect(&self) {
        let Some(link) = self.inner.link.lock().take() else {
            debug!("realtime channel already disconnected");
            return;
        };
        link.pump.abort();
        drop(link.outbound);
        self.inner
            .status
            .send_replace(ChannelStatus::disconnected(None));
        info!(connection = link.id.0, "realtime channel disconnected");
        self.inner
            .dispatch(EVENT_DISCONNECT, &json!({ "reason": "client disconnect" }));
    }

    fn held_link(&self) -> Option<(ConnectionId, String)> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| (link.id, link.token.clone()))
    }

    /// Fire-and-forget emission on the live link.
    pub fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        let frame = event
            .into_frame()
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        let slot = self.inner.link.lock();
        let Some(link) = slot.as_ref() else {
            debug!(event = %frame.event, "not connected, dropping realtime event");
            return Err(ChannelError::NotConnected);
        };
        link.outbound
            .send(frame)
            .map_err(|_| ChannelError::NotConnected)
    }

    pub fn send_message(
        &self,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::SendMessage {
            receiver_id: receiver_id.into(),
            content: content.into(),
        })
    }

    pub fn join_conversation(&self, other_user_id: impl Into<String>) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::JoinConversation {
            other_user_id: other_user_id.into(),
        })
    }

    pub fn leave_conversation(&self, other_user_id: impl Into<String>) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::LeaveConversation {
            other_user_id: other_user_id.into(),
        })
    }

    pub fn set_typing(
        &self,
        receiver_id: impl Into<String>,
        is_typing: bool,
    ) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::Typing {
            receiver_id: receiver_id.into(),
            is_typing,
        })
    }

    /// Register a raw handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Detach `handler` from `event`, or every handler of `event` when `None`.
    /// Returns how many were removed.
    pub fn off(&self, event: &str, handler: Option<HandlerId>) -> usize {
        let mut handlers = self.inner.handlers.write();
        let Some(registered) = handlers.get_mut(event) else {
            return 0;
        };
        let before = registered.len();
        match handler {
            Some(id) => registered.retain(|(existing, _)| *existing != id),
            None => registered.clear(),
        }
        let removed = before - registered.len();
        if registered.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn on_payload<T, F>(&self, event: &'static str, handler: F) -> HandlerId
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on(event, move |data| match serde_json::from_value::<T>(data.clone()) {
            Ok(payload) => handler(payload),
            Err(err) => warn!(event, %err, "ignoring malformed realtime payload"),
        })
    }

    pub fn on_new_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_payload(EVENT_NEW_MESSAGE, handler)
    }

    pub fn on_message_sent<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_payload(EVENT_MESSAGE_SENT, handler)
    }

    pub fn on_user_typing<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(TypingEvent) + Send + Sync + 'static,
    {
        self.on_payload(EVENT_USER_TYPING, handler)
    }

    pub fn on_user_online<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(OnlineEvent) + Send + Sync + 'static,
    {
        self.on_payload(EVENT_USER_ONLINE, handler)
    }

    pub fn on_user_offline<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(OfflineEvent) + Send + Sync + 'static,
    {
        self.on_payload(EVENT_USER_OFFLINE, handler)
    }

    /// One handler for every modelled server event, decoded. Returns the
    /// registrations so they can be passed back to [`RealtimeChannel::off`].
    pub fn on_server_event<F>(&self, handler: F) -> Vec<(&'static str, HandlerId)>
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        SERVER_EVENTS
            .iter()
            .map(|&event| {
                let handler = handler.clone();
                let id = self.on(event, move |data| {
                    match InboundEvent::from_frame(&Frame::new(event, data.clone())) {
                        Ok(Some(decoded)) => handler(decoded),
                        Ok(None) => {}
                        Err(err) => warn!(event, %err, "ignoring malformed realtime payload"),
                    }
                });
                (event, id)
            })
            .collect()
    }

    pub fn on_connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EVENT_CONNECT, move |_| handler())
    }

    pub fn on_disconnect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on(EVENT_DISCONNECT, move |data| handler(text_field(data, "reason")))
    }

    pub fn on_connect_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on(EVENT_CONNECT_ERROR, move |data| {
            handler(text_field(data, "message"))
        })
    }
}

impl ChannelInner {
    fn dispatch(&self, event: &str, data: &Value) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(event)
            .map(|registered| registered.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(data);
        }
    }

    fn retire(&self, id: ConnectionId, reason: String) {
        let retired = {
            let mut slot = self.link.lock();
            if slot.as_ref().is_some_and(|link| link.id == id) {
                slot.take()
            } else {
                None
            }
        };
        if retired.is_none() {
            return;
        }
        self.status.send_replace(ChannelStatus::disconnected(None));
        info!(connection = id.0, %reason, "realtime channel dropped");
        self.dispatch(EVENT_DISCONNECT, &json!({ "reason": reason }));
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.pump.abort();
        }
    }
}

/// Delivers inbound frames of one link, in arrival order, until it closes.
async fn pump(inner: Weak<ChannelInner>, id: ConnectionId, mut inbound: UnboundedReceiver<LinkEvent>) {
    match inner.upgrade() {
        Some(inner) => inner.dispatch(EVENT_CONNECT, &json!({})),
        None => return,
    }
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Frame(frame) => {
                if matches!(
                    frame.event.as_str(),
                    EVENT_CONNECT | EVENT_DISCONNECT | EVENT_CONNECT_ERROR
                ) {
                    warn!(event = %frame.event, "server sent a reserved event name");
                    continue;
                }
                inner.dispatch(&frame.event, &frame.data);
            }
            LinkEvent::Closed { reason } => {
                inner.retire(id, reason);
                return;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.retire(id, "link closed".to_string());
    }
}

fn text_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
