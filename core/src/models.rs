use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used for ids of messages that only exist locally until the server
/// confirms them.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Build an unconfirmed outgoing message.
    pub fn local(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// The id of the other participant, seen from `self_id`.
    ///
    /// Messages that involve neither side of `self_id` are keyed by sender.
    pub fn counterpart<'a>(&'a self, self_id: &str) -> &'a str {
        if self.sender_id == self_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<UserRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Teacher,
    Parent,
    Student,
}

/// A user the signed-in account may open a conversation with.
pub type ChatUser = UserProfile;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableUser {
    #[serde(flatten)]
    pub user: ChatUser,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub user: ChatUser,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    pub user_name: String,
}
