//! Error types for the gateway layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use lendahand_auth::IdentityError;
use lendahand_conversations::ConversationError;
use lendahand_realtime::StoreError;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("service error: {0}")]
    ServiceError(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AuthorizationFailed(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::DatabaseError(_) | GatewayError::ServiceError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Body of every error reply.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Numeric HTTP status as a string.
    pub error: String,
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            error: status.as_str().to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<IdentityError> for GatewayError {
    fn from(error: IdentityError) -> Self {
        match error {
            IdentityError::UserExists => {
                GatewayError::Conflict("user already exists".to_string())
            }
            IdentityError::InvalidToken => {
                GatewayError::AuthenticationFailed("unknown session token".to_string())
            }
            IdentityError::SessionExpired => {
                GatewayError::AuthenticationFailed("session expired".to_string())
            }
            IdentityError::InvalidSession => {
                GatewayError::AuthenticationFailed("invalid session record".to_string())
            }
            IdentityError::Database(err) => GatewayError::DatabaseError(err.to_string()),
        }
    }
}

impl From<ConversationError> for GatewayError {
    fn from(error: ConversationError) -> Self {
        match error {
            ConversationError::ConversationNotFound => {
                GatewayError::NotFound("conversation not found".to_string())
            }
            ConversationError::UserNotFound => {
                GatewayError::NotFound("user not found".to_string())
            }
            ConversationError::ParticipantExists => {
                GatewayError::Conflict("participant already exists".to_string())
            }
            ConversationError::Database(err) => GatewayError::DatabaseError(err.to_string()),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(resource) => GatewayError::NotFound(resource),
            StoreError::Unavailable(reason) => GatewayError::ServiceError(reason),
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(error: sqlx::Error) -> Self {
        GatewayError::DatabaseError(error.to_string())
    }
}
