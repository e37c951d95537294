//! Conversation history endpoints

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ErrorResponse, GatewayError, GatewayResult};
use crate::state::AppState;
use lendahand_conversations::MessageView;
use lendahand_realtime::Identity;

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Messages to skip, counted back from the newest.
    pub skip: Option<i64>,
    /// Page size, clamped to 1..=100. Defaults to 50.
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

impl From<MessageView> for MessageResponse {
    fn from(view: MessageView) -> Self {
        Self {
            id: view.id,
            conversation_id: view.conversation_id,
            sender_id: view.sender_id,
            sender_name: view.sender_name,
            content: view.content,
            status: view.status,
            created_at: view.created_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/conversations/{conversation_id}/messages",
    tag = "messages",
    params(
        ("conversation_id" = String, Path, description = "Conversation public ID"),
        HistoryQuery
    ),
    responses(
        (status = 200, description = "Newest-first page of messages", body = Vec<MessageResponse>),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller is not a participant", body = ErrorResponse)
    )
)]
pub async fn list_messages(
    Path(conversation_id): Path<String>,
    Query(params): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> GatewayResult<Json<Vec<MessageResponse>>> {
    let role = state
        .participants
        .role_of(&conversation_id, identity.user_id)
        .await?;
    if role.is_none() {
        return Err(GatewayError::AuthorizationFailed(
            "not a participant in this conversation".to_string(),
        ));
    }

    let page = state
        .messages
        .history_page(&conversation_id, params.skip, params.limit)
        .await?;

    Ok(Json(page.into_iter().map(MessageResponse::from).collect()))
}

pub fn create_message_routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/conversations/:conversation_id/messages",
        get(list_messages),
    )
}
