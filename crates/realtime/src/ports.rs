//! Collaborator interfaces consumed by the realtime core.
//!
//! The core reads identity, membership and message durability through these
//! traits and nothing else; sqlite-backed implementations live in the
//! `lendahand-auth` and `lendahand-conversations` crates, mocks in the unit
//! tests here.

use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Verified identity of a connected user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub public_id: String,
    pub display_name: String,
}

/// Role a user holds inside a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Admin => "admin",
            ParticipantRole::Member => "member",
        }
    }
}

impl From<&str> for ParticipantRole {
    fn from(value: &str) -> Self {
        match value {
            "admin" => ParticipantRole::Admin,
            _ => ParticipantRole::Member,
        }
    }
}

/// Resolves identity tokens presented at connection time.
pub trait IdentityVerifier {
    /// Resolve a bearer token. `Ok(None)` means the token is unknown or
    /// expired; both close the connection.
    async fn verify(&self, token: &str) -> Result<Option<Identity>, StoreError>;
}

/// Read-only view of conversation membership.
///
/// The core never caches results from this trait: membership is re-read on
/// every authorization decision so a removal takes effect on the user's
/// next operation.
pub trait ParticipantDirectory {
    /// The user's role in the conversation, `None` when not a participant.
    async fn membership(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<Option<ParticipantRole>, StoreError>;

    /// Public ids of every conversation the user belongs to.
    async fn conversations_for_user(&self, user_id: i64) -> Result<Vec<String>, StoreError>;
}

/// A message as handed to the store for persistence.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: String,
    pub sender_id: i64,
    pub content: String,
}

/// The durable form of a message, returned once the write is acknowledged.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub public_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Durable message storage. The router persists through this trait before
/// any fan-out, so visibility never precedes durability.
pub trait MessageStore {
    async fn save(&self, draft: MessageDraft) -> Result<StoredMessage, StoreError>;
}
