//! Wire format of the realtime channel.
//!
//! Every frame is a JSON text message `{ "event": <name>, "data": <payload> }`.

use crate::models::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

pub const EVENT_NEW_MESSAGE: &str = "newMessage";
pub const EVENT_MESSAGE_SENT: &str = "messageSent";
pub const EVENT_USER_TYPING: &str = "userTyping";
pub const EVENT_USER_ONLINE: &str = "userOnline";
pub const EVENT_USER_OFFLINE: &str = "userOffline";

/// Every event name the server pushes that [`InboundEvent`] models.
pub const SERVER_EVENTS: [&str; 5] = [
    EVENT_NEW_MESSAGE,
    EVENT_MESSAGE_SENT,
    EVENT_USER_TYPING,
    EVENT_USER_ONLINE,
    EVENT_USER_OFFLINE,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Events this client emits.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    Auth {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        receiver_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinConversation {
        other_user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveConversation {
        other_user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        receiver_id: String,
        is_typing: bool,
    },
}

impl OutboundEvent {
    pub fn into_frame(self) -> Result<Frame, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineEvent {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEvent {
    pub user_id: String,
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(Message),
    MessageSent(Message),
    UserTyping(TypingEvent),
    UserOnline(OnlineEvent),
    UserOffline(OfflineEvent),
}

impl InboundEvent {
    /// Decode a known event; `Ok(None)` for event names this client does not model.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, serde_json::Error> {
        let data = frame.data.clone();
        let event = match frame.event.as_str() {
            EVENT_NEW_MESSAGE => Self::NewMessage(serde_json::from_value(data)?),
            EVENT_MESSAGE_SENT => Self::MessageSent(serde_json::from_value(data)?),
            EVENT_USER_TYPING => Self::UserTyping(serde_json::from_value(data)?),
            EVENT_USER_ONLINE => Self::UserOnline(serde_json::from_value(data)?),
            EVENT_USER_OFFLINE => Self::UserOffline(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
