//! Shared application state for the gateway

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use lendahand_auth::Authenticator;
use lendahand_config::{AppConfig, RealtimeConfig};
use lendahand_conversations::{MessageService, ParticipantService};
use lendahand_realtime::{
    ConnectionRegistry, ConversationAuthorizer, MessageRouter, PresenceTracker,
    TypingIndicatorStore,
};

/// The realtime router with its production ports plugged in.
pub type RealtimeRouter = MessageRouter<Authenticator, ParticipantService, MessageService>;

/// Shared application state containing all services
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub pool: SqlitePool,
    /// Session verification and user lookup
    pub authenticator: Authenticator,
    /// Conversation membership reads and writes
    pub participants: ParticipantService,
    /// Message history and persistence
    pub messages: MessageService,
    /// Membership decisions for the REST surface
    pub authorizer: ConversationAuthorizer<ParticipantService>,
    /// Frame routing for live connections
    pub realtime: Arc<RealtimeRouter>,
    /// Connection registry backing the realtime router
    pub registry: Arc<ConnectionRegistry>,
    /// Typing indicator bookkeeping, shared with the background sweeper
    pub typing: Arc<TypingIndicatorStore>,
    /// Queue depth and idle timeout for WebSocket connections
    pub realtime_config: RealtimeConfig,
}

impl AppState {
    /// Create a new gateway state with all services initialised.
    pub fn new(pool: SqlitePool, config: &AppConfig) -> Self {
        let authenticator = Authenticator::new(pool.clone(), config.auth.clone());
        let participants = ParticipantService::new(pool.clone());
        let messages = MessageService::new(pool.clone());
        let authorizer = ConversationAuthorizer::new(participants.clone());

        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new());
        let typing = Arc::new(TypingIndicatorStore::new());
        let realtime = Arc::new(MessageRouter::new(
            authenticator.clone(),
            participants.clone(),
            messages.clone(),
            registry.clone(),
            presence,
            typing.clone(),
            Duration::from_secs(config.realtime.typing_ttl_seconds),
        ));

        Self {
            pool,
            authenticator,
            participants,
            messages,
            authorizer,
            realtime,
            registry,
            typing,
            realtime_config: config.realtime.clone(),
        }
    }
}
