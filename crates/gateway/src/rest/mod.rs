//! REST API endpoints for the gateway

pub mod health;
pub mod message;
pub mod participant;

use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

/// REST routes that sit behind the bearer-token middleware.
pub fn create_rest_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(message::create_message_routes())
        .merge(participant::create_participant_routes())
}
