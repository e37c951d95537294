//! Participant management endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{ErrorResponse, GatewayError, GatewayResult};
use crate::state::AppState;
use lendahand_realtime::{Identity, ParticipantRole};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddParticipantRequest {
    /// Public ID of the user to add.
    pub user_id: String,
    /// Either "member" or "admin". Defaults to "member".
    pub role: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ParticipantResponse {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: String,
}

#[utoipa::path(
    post,
    path = "/api/conversations/{conversation_id}/participants",
    tag = "participants",
    params(
        ("conversation_id" = String, Path, description = "Conversation public ID")
    ),
    request_body = AddParticipantRequest,
    responses(
        (status = 201, description = "Participant added", body = ParticipantResponse),
        (status = 400, description = "Unknown role", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller cannot manage participants", body = ErrorResponse),
        (status = 404, description = "Conversation or user not found", body = ErrorResponse),
        (status = 409, description = "Already a participant", body = ErrorResponse)
    )
)]
pub async fn add_participant(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<AddParticipantRequest>,
) -> GatewayResult<impl IntoResponse> {
    require_manage(&state, &conversation_id, &identity).await?;

    let role = match payload.role.as_deref() {
        None | Some("member") => ParticipantRole::Member,
        Some("admin") => ParticipantRole::Admin,
        Some(other) => {
            return Err(GatewayError::InvalidRequest(format!("unknown role: {other}")));
        }
    };

    let participant = state
        .participants
        .add_participant(&conversation_id, &payload.user_id, role)
        .await?;

    info!(
        conversation = %conversation_id,
        user = %payload.user_id,
        role = %participant.role,
        "participant added"
    );

    let response = ParticipantResponse {
        conversation_id,
        user_id: payload.user_id,
        role: participant.role,
        joined_at: participant.joined_at,
    };

    Ok((StatusCode::CREATED, Json(response)))
}

#[utoipa::path(
    delete,
    path = "/api/conversations/{conversation_id}/participants/{user_id}",
    tag = "participants",
    params(
        ("conversation_id" = String, Path, description = "Conversation public ID"),
        ("user_id" = String, Path, description = "Public ID of the user to remove")
    ),
    responses(
        (status = 204, description = "Participant removed and live subscriptions revoked"),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller cannot manage participants", body = ErrorResponse),
        (status = 404, description = "No such participant", body = ErrorResponse)
    )
)]
pub async fn remove_participant(
    Path((conversation_id, user_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> GatewayResult<impl IntoResponse> {
    require_manage(&state, &conversation_id, &identity).await?;

    let removed = state
        .participants
        .remove_participant(&conversation_id, &user_id)
        .await?;

    let Some(removed_user_id) = removed else {
        return Err(GatewayError::NotFound("no such participant".to_string()));
    };

    // The membership row is gone; cut live subscriptions so the removed
    // user stops receiving fan-out immediately rather than on next send.
    state
        .realtime
        .revoke_subscriptions(&conversation_id, removed_user_id)
        .await;

    info!(
        conversation = %conversation_id,
        user = %user_id,
        "participant removed"
    );

    Ok(StatusCode::NO_CONTENT)
}

async fn require_manage(
    state: &AppState,
    conversation_id: &str,
    identity: &Identity,
) -> GatewayResult<()> {
    let allowed = state
        .authorizer
        .can_manage(conversation_id, identity.user_id)
        .await?;
    if !allowed {
        return Err(GatewayError::AuthorizationFailed(
            "only conversation admins can manage participants".to_string(),
        ));
    }

    Ok(())
}

pub fn create_participant_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/conversations/:conversation_id/participants",
            post(add_participant),
        )
        .route(
            "/api/conversations/:conversation_id/participants/:user_id",
            delete(remove_participant),
        )
}
