//! Error types for the realtime core.

use thiserror::Error;

use crate::frames::{ErrorFrame, ServerFrame};

/// Wire error codes emitted inside `error` frames.
pub mod codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";
}

/// Errors raised while servicing a single connection or operation.
///
/// Only `Auth` is fatal to the connection. Everything else is recovered at
/// the router boundary and turned into an `error` frame or a registry
/// cleanup; no variant ever crosses a connection's task boundary.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("access denied to {conversation_id}: {reason}")]
    Authorization {
        conversation_id: String,
        reason: String,
    },

    #[error("invalid frame: {reason}")]
    Validation { reason: String },

    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    #[error("transport failure: {reason}")]
    Transport { reason: String },
}

impl RealtimeError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn authorization(conversation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authorization {
            conversation_id: conversation_id.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// The wire code carried by the corresponding `error` frame.
    ///
    /// Transport failures are never reported to the sender; their code
    /// exists for logging only.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Auth { .. } => codes::AUTH_FAILED,
            Self::Authorization { .. } => codes::ACCESS_DENIED,
            Self::Validation { .. } => codes::INVALID_FRAME,
            Self::Persistence { .. } => codes::PERSISTENCE_FAILED,
            Self::Transport { .. } => "TRANSPORT_FAILED",
        }
    }

    /// Render this error as a frame addressed to the offending sender.
    pub fn to_frame(&self) -> ServerFrame {
        let conversation_id = match self {
            Self::Authorization {
                conversation_id, ..
            } => Some(conversation_id.clone()),
            _ => None,
        };
        ServerFrame::Error(ErrorFrame {
            code: self.wire_code().to_string(),
            message: self.to_string(),
            conversation_id,
        })
    }
}

/// Failures reported by the identity, membership and message collaborators.
///
/// The realtime core never sees the collaborator's own error types (or its
/// database driver); implementations fold everything into this shape at the
/// port boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for RealtimeError {
    fn from(err: StoreError) -> Self {
        Self::Persistence {
            reason: err.to_string(),
        }
    }
}
