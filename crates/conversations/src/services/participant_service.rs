//! Membership reads and writes, plus the directory port for the realtime
//! core.

use lendahand_realtime::{ParticipantDirectory, ParticipantRole, StoreError};
use sqlx::SqlitePool;

use crate::entities::Participant;
use crate::error::ConversationResult;
use crate::repositories::ParticipantRepository;

#[derive(Clone)]
pub struct ParticipantService {
    repository: std::sync::Arc<ParticipantRepository>,
}

impl ParticipantService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repository: std::sync::Arc::new(ParticipantRepository::new(pool)),
        }
    }

    pub async fn role_of(
        &self,
        conversation_public_id: &str,
        user_id: i64,
    ) -> ConversationResult<Option<ParticipantRole>> {
        self.repository
            .find_role(conversation_public_id, user_id)
            .await
    }

    pub async fn conversations_of(&self, user_id: i64) -> ConversationResult<Vec<String>> {
        self.repository.conversation_ids_for_user(user_id).await
    }

    pub async fn add_participant(
        &self,
        conversation_public_id: &str,
        user_public_id: &str,
        role: ParticipantRole,
    ) -> ConversationResult<Participant> {
        self.repository
            .add(conversation_public_id, user_public_id, role)
            .await
    }

    /// Remove a participant, returning the internal user id of the removed
    /// row so callers can cut the user's live subscriptions.
    pub async fn remove_participant(
        &self,
        conversation_public_id: &str,
        user_public_id: &str,
    ) -> ConversationResult<Option<i64>> {
        self.repository
            .remove(conversation_public_id, user_public_id)
            .await
    }
}

impl ParticipantDirectory for ParticipantService {
    async fn membership(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<Option<ParticipantRole>, StoreError> {
        self.repository
            .find_role(conversation_id, user_id)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn conversations_for_user(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        self.repository
            .conversation_ids_for_user(user_id)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}
