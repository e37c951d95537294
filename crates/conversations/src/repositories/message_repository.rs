//! Repository for message rows.

use chrono::Utc;
use sqlx::{Row, SqlitePool, Transaction};
use tracing::info;

use crate::entities::{Message, MessageStatus, MessageView};
use crate::error::ConversationResult;

pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one message. Caller owns the transaction so the insert can be
    /// committed together with the conversation's last-message pointer.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
    ) -> ConversationResult<Message> {
        let public_id = cuid2::cuid();
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO messages (public_id, conversation_id, sender_id, content, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&public_id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(MessageStatus::Sent.as_str())
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        let id = result.last_insert_rowid();
        info!(message = %public_id, conversation_id, sender_id, "persisted message");

        Ok(Message {
            id,
            public_id,
            conversation_id,
            sender_id,
            content: content.to_string(),
            status: MessageStatus::Sent,
            created_at: now,
        })
    }

    /// One page of a conversation's history, newest first. `skip` counts
    /// from the newest message.
    pub async fn list_page(
        &self,
        conversation_id: i64,
        skip: i64,
        limit: i64,
    ) -> ConversationResult<Vec<MessageView>> {
        let rows = sqlx::query(
            "SELECT m.public_id, c.public_id AS conversation_public_id,
                    u.public_id AS sender_public_id, u.display_name AS sender_name,
                    m.content, m.status, m.created_at
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ?
             ORDER BY m.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(MessageView {
                id: row.try_get("public_id")?,
                conversation_id: row.try_get("conversation_public_id")?,
                sender_id: row.try_get("sender_public_id")?,
                sender_name: row.try_get("sender_name")?,
                content: row.try_get("content")?,
                status: row.try_get("status")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(messages)
    }
}
