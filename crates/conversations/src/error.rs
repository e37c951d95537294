//! Error types for the conversation storage layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("participant already exists")]
    ParticipantExists,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type ConversationResult<T> = Result<T, ConversationError>;
