//! Message persistence and history reads.

use chrono::{DateTime, Utc};
use lendahand_realtime::{MessageDraft, MessageStore, StoreError, StoredMessage};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::entities::{Message, MessageView};
use crate::error::{ConversationError, ConversationResult};
use crate::repositories::{ConversationRepository, MessageRepository};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Clone)]
pub struct MessageService {
    pool: SqlitePool,
    messages: Arc<MessageRepository>,
    conversations: Arc<ConversationRepository>,
}

impl MessageService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            messages: Arc::new(MessageRepository::new(pool.clone())),
            conversations: Arc::new(ConversationRepository::new(pool.clone())),
            pool,
        }
    }

    /// Persist one message and move the conversation's last-message pointer,
    /// atomically.
    pub async fn record(
        &self,
        conversation_public_id: &str,
        sender_id: i64,
        content: &str,
    ) -> ConversationResult<Message> {
        let conversation = self
            .conversations
            .find_by_public_id(conversation_public_id)
            .await?
            .ok_or(ConversationError::ConversationNotFound)?;

        let mut tx = self.pool.begin().await?;
        let message = self
            .messages
            .insert(&mut tx, conversation.id, sender_id, content)
            .await?;
        self.conversations
            .touch_last_message(&mut tx, conversation.id, message.id)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    /// A page of history, newest first. `skip` counts back from the newest
    /// message; `limit` is clamped to 1..=100 and defaults to 50.
    pub async fn history_page(
        &self,
        conversation_public_id: &str,
        skip: Option<i64>,
        limit: Option<i64>,
    ) -> ConversationResult<Vec<MessageView>> {
        let conversation = self
            .conversations
            .find_by_public_id(conversation_public_id)
            .await?
            .ok_or(ConversationError::ConversationNotFound)?;

        let skip = skip.unwrap_or(0).max(0);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        self.messages.list_page(conversation.id, skip, limit).await
    }
}

impl MessageStore for MessageService {
    async fn save(&self, draft: MessageDraft) -> Result<StoredMessage, StoreError> {
        let message = self
            .record(&draft.conversation_id, draft.sender_id, &draft.content)
            .await
            .map_err(|err| match err {
                ConversationError::ConversationNotFound => {
                    StoreError::NotFound(draft.conversation_id.clone())
                }
                other => StoreError::Unavailable(other.to_string()),
            })?;

        let created_at = DateTime::parse_from_rfc3339(&message.created_at)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?
            .with_timezone(&Utc);

        Ok(StoredMessage {
            public_id: message.public_id,
            status: message.status.as_str().to_string(),
            created_at,
        })
    }
}
