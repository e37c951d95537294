//! Repository for conversation membership rows.

use chrono::Utc;
use lendahand_realtime::ParticipantRole;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::entities::Participant;
use crate::error::{ConversationError, ConversationResult};

pub struct ParticipantRepository {
    pool: SqlitePool,
}

impl ParticipantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The role a user holds in a conversation, by conversation public id.
    pub async fn find_role(
        &self,
        conversation_public_id: &str,
        user_id: i64,
    ) -> ConversationResult<Option<ParticipantRole>> {
        let row = sqlx::query(
            "SELECT p.role FROM participants p
             JOIN conversations c ON c.id = p.conversation_id
             WHERE c.public_id = ? AND p.user_id = ?",
        )
        .bind(conversation_public_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let role: String = row.try_get("role")?;
                Ok(Some(ParticipantRole::from(role.as_str())))
            }
            None => Ok(None),
        }
    }

    /// Public ids of every conversation the user participates in.
    pub async fn conversation_ids_for_user(&self, user_id: i64) -> ConversationResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT c.public_id FROM participants p
             JOIN conversations c ON c.id = p.conversation_id
             WHERE p.user_id = ?
             ORDER BY c.public_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get("public_id").map_err(ConversationError::Database))
            .collect()
    }

    /// Add a user to a conversation, resolving both sides by public id.
    pub async fn add(
        &self,
        conversation_public_id: &str,
        user_public_id: &str,
        role: ParticipantRole,
    ) -> ConversationResult<Participant> {
        let conversation_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE public_id = ?")
                .bind(conversation_public_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(conversation_id) = conversation_id else {
            return Err(ConversationError::ConversationNotFound);
        };

        let user_id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE public_id = ?")
            .bind(user_public_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(user_id) = user_id else {
            return Err(ConversationError::UserNotFound);
        };

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(ConversationError::ParticipantExists);
        }

        let joined_at = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO participants (conversation_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(&joined_at)
        .execute(&self.pool)
        .await?;

        info!(
            conversation = conversation_public_id,
            user = user_public_id,
            role = role.as_str(),
            "added participant"
        );

        Ok(Participant {
            id: result.last_insert_rowid(),
            conversation_id,
            user_id,
            role: role.as_str().to_string(),
            joined_at,
        })
    }

    /// Remove a user from a conversation. Returns the removed user's row id
    /// when a row was deleted.
    pub async fn remove(
        &self,
        conversation_public_id: &str,
        user_public_id: &str,
    ) -> ConversationResult<Option<i64>> {
        let user_id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE public_id = ?")
            .bind(user_public_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(user_id) = user_id else {
            return Ok(None);
        };

        let result = sqlx::query(
            "DELETE FROM participants WHERE user_id = ? AND conversation_id IN
             (SELECT id FROM conversations WHERE public_id = ?)",
        )
        .bind(user_id)
        .bind(conversation_public_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        info!(
            conversation = conversation_public_id,
            user = user_public_id,
            "removed participant"
        );
        Ok(Some(user_id))
    }
}
