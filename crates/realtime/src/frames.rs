//! Wire frames exchanged over a realtime connection.
//!
//! Both unions are closed: an unknown `type` fails deserialization at the
//! transport boundary and never reaches the router.

use serde::{Deserialize, Serialize};

/// Frames received from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe this connection to a conversation's live events.
    Join { conversation_id: String },
    /// Unsubscribe from a conversation.
    Leave { conversation_id: String },
    /// Persist and fan out a message.
    SendMessage {
        conversation_id: String,
        payload: MessagePayload,
    },
    /// Start (or refresh) this user's typing indicator.
    TypingStart { conversation_id: String },
    /// Clear this user's typing indicator.
    TypingStop { conversation_id: String },
    /// Ask for the set of currently online users.
    GetOnlineUsers,
}

impl ClientFrame {
    /// Wire name of the frame kind, used when acknowledging it.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::GetOnlineUsers => "get_online_users",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub content: String,
}

/// Frames pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage(MessageBroadcast),
    TypingUpdate(TypingBroadcast),
    PresenceUpdate(PresenceBroadcast),
    Ack(AckFrame),
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBroadcast {
    /// Public id of the persisted message.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingBroadcast {
    pub conversation_id: String,
    /// Public ids of users currently typing, sorted for stable output.
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceBroadcast {
    pub user_id: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckFrame {
    /// The inbound frame kind this acknowledges.
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_users: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ServerFrame {
    pub fn ack(op: &str, conversation_id: Option<String>) -> Self {
        Self::Ack(AckFrame {
            op: op.to_string(),
            conversation_id,
            message_id: None,
            online_users: None,
        })
    }

    pub fn message_ack(conversation_id: String, message_id: String) -> Self {
        Self::Ack(AckFrame {
            op: "send_message".to_string(),
            conversation_id: Some(conversation_id),
            message_id: Some(message_id),
            online_users: None,
        })
    }

    pub fn online_users(user_ids: Vec<String>) -> Self {
        Self::Ack(AckFrame {
            op: "get_online_users".to_string(),
            conversation_id: None,
            message_id: None,
            online_users: Some(user_ids),
        })
    }

    pub fn typing_update(conversation_id: String, user_ids: Vec<String>) -> Self {
        Self::TypingUpdate(TypingBroadcast {
            conversation_id,
            user_ids,
        })
    }

    pub fn presence_update(user_id: String, online: bool, last_seen: Option<String>) -> Self {
        Self::PresenceUpdate(PresenceBroadcast {
            user_id,
            online,
            last_seen,
        })
    }

    pub fn error(code: &str, message: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self::Error(ErrorFrame {
            code: code.to_string(),
            message: message.into(),
            conversation_id,
        })
    }
}
