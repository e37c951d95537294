//! # LendAHand Gateway Crate
//!
//! HTTP and WebSocket surface for the LendAHand messaging backend. REST
//! routes cover history reads and participant management; the
//! `/ws/conversations` endpoint hands accepted sockets to the realtime
//! router for frame dispatch.

pub mod error;
pub mod middleware;
pub mod rest;
pub mod state;
pub mod websocket;

pub use error::{ErrorResponse, GatewayError, GatewayResult};
pub use state::{AppState, RealtimeRouter};

use axum::{http::Method, middleware as axum_middleware, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Create the main application router with all routes.
pub fn create_router(state: AppState) -> Router {
    let arc_state = Arc::new(state);

    let protected = rest::create_rest_routes().route_layer(axum_middleware::from_fn_with_state(
        arc_state.clone(),
        middleware::auth_middleware,
    ));

    let mut router = Router::new()
        .merge(protected)
        .merge(rest::health::create_health_routes())
        .merge(websocket::create_websocket_routes())
        .with_state(arc_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::AUTHORIZATION,
                    axum::http::header::ACCEPT,
                    axum::http::header::CONTENT_TYPE,
                ]),
        )
        .layer(axum_middleware::from_fn(middleware::logging_middleware));

    // Swagger UI is only mounted in debug builds.
    #[cfg(debug_assertions)]
    {
        #[derive(OpenApi)]
        #[openapi(
            paths(
                rest::health::health_check,
                rest::message::list_messages,
                rest::participant::add_participant,
                rest::participant::remove_participant,
            ),
            components(schemas(
                error::ErrorResponse,
                rest::health::HealthResponse,
                rest::message::MessageResponse,
                rest::participant::AddParticipantRequest,
                rest::participant::ParticipantResponse,
            )),
            tags(
                (name = "health", description = "Service liveness"),
                (name = "messages", description = "Conversation history"),
                (name = "participants", description = "Conversation membership management"),
            )
        )]
        struct ApiDoc;

        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    router
}
