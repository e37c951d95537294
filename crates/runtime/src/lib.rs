use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use lendahand_auth::Authenticator;
use lendahand_config::AppConfig;
use lendahand_conversations::{MessageService, ParticipantService};

pub mod database;

pub use database::{initialize_database, prepare_database, run_migrations, MIGRATOR};

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::INFO)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// Service handles shared by the HTTP gateway and the CLI commands.
#[derive(Clone)]
pub struct BackendServices {
    pub db_pool: SqlitePool,
    pub authenticator: Authenticator,
    pub participants: ParticipantService,
    pub messages: MessageService,
}

impl BackendServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let db_pool = database::initialize_database(&config.database).await?;

        let authenticator = Authenticator::new(db_pool.clone(), config.auth.clone());
        let participants = ParticipantService::new(db_pool.clone());
        let messages = MessageService::new(db_pool.clone());

        info!("backend services initialised");

        Ok(Self {
            db_pool,
            authenticator,
            participants,
            messages,
        })
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
