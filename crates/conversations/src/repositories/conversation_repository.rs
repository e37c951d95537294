//! Repository for conversation rows.

use chrono::Utc;
use sqlx::{Row, SqlitePool, Transaction};
use tracing::info;

use crate::entities::Conversation;
use crate::error::{ConversationError, ConversationResult};

pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, title: &str, created_by: i64) -> ConversationResult<Conversation> {
        let public_id = cuid2::cuid();
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO conversations (public_id, title, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&public_id)
        .bind(title)
        .bind(created_by)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(conversation = %public_id, id, "created conversation");

        Ok(Conversation {
            id,
            public_id,
            title: title.to_string(),
            created_by,
            last_message_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn find_by_public_id(
        &self,
        public_id: &str,
    ) -> ConversationResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, public_id, title, created_by, last_message_id, created_at, updated_at
             FROM conversations WHERE public_id = ?",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Conversation {
                id: row.try_get("id")?,
                public_id: row.try_get("public_id")?,
                title: row.try_get("title")?,
                created_by: row.try_get("created_by")?,
                last_message_id: row.try_get("last_message_id")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(ConversationError::Database)
    }

    /// Point the conversation at its newest message. Runs inside the same
    /// transaction as the message insert so the pointer never leads or
    /// trails the messages table.
    pub async fn touch_last_message(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        conversation_id: i64,
        message_id: i64,
    ) -> ConversationResult<()> {
        sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(message_id)
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}
