//! Entity definitions for the conversation graph.

use lendahand_realtime::ParticipantRole;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub public_id: String,
    pub title: String,
    pub created_by: i64,
    pub last_message_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: String,
    pub joined_at: String,
}

impl Participant {
    pub fn role(&self) -> ParticipantRole {
        ParticipantRole::from(self.role.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub public_id: String,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl From<&str> for MessageStatus {
    fn from(value: &str) -> Self {
        match value {
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            _ => MessageStatus::Sent,
        }
    }
}

/// A message joined with its sender and conversation public ids, shaped the
/// same way as the `new_message` broadcast so clients can splice history
/// and live frames without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}
