//! Membership-based authorization decisions.

use crate::error::StoreError;
use crate::ports::{ParticipantDirectory, ParticipantRole};

/// Decides whether a user may subscribe to, send into, or manage a
/// conversation. Holds no state of its own: every decision re-reads the
/// participant directory, so a membership change is honoured on the user's
/// very next operation.
#[derive(Clone)]
pub struct ConversationAuthorizer<D> {
    directory: D,
}

impl<D> ConversationAuthorizer<D>
where
    D: ParticipantDirectory,
{
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Any participant may join and send.
    pub async fn can_join(&self, conversation_id: &str, user_id: i64) -> Result<bool, StoreError> {
        let role = self.directory.membership(conversation_id, user_id).await?;
        Ok(role.is_some())
    }

    /// Only admins may manage the participant list.
    pub async fn can_manage(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<bool, StoreError> {
        let role = self.directory.membership(conversation_id, user_id).await?;
        Ok(matches!(role, Some(ParticipantRole::Admin)))
    }
}
