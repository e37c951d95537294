use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lendahand_config::load as load_config;
use lendahand_conversations::ConversationRepository;
use lendahand_gateway::{create_router, AppState};
use lendahand_realtime::{run_typing_sweeper, ParticipantRole};
use lendahand_runtime::{telemetry, BackendServices};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "lendahand-server")]
#[command(about = "LendAHand messaging backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server (default)
    Serve,
    /// Seed the database with demo users and a conversation
    Seed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server().await,
        Commands::Seed => seed_data().await,
    }
}

async fn run_server() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise tracing")?;

    info!("starting LendAHand backend");

    let config = load_config().context("failed to load configuration")?;

    let services = BackendServices::initialise(&config)
        .await
        .context("failed to initialise backend services")?;

    let state = AppState::new(services.db_pool.clone(), &config);
    let sweeper = run_typing_sweeper(
        state.registry.clone(),
        state.typing.clone(),
        Duration::from_secs(config.realtime.typing_sweep_interval_seconds),
    );
    let app = create_router(state);

    let address = format!("{}:{}", config.http.address, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    info!(%address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(lendahand_runtime::shutdown_signal())
        .await
        .context("http server error")?;

    sweeper.stop();
    info!("backend shut down");
    Ok(())
}

async fn seed_data() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise tracing")?;

    info!("seeding database with demo data");

    let config = load_config().context("failed to load configuration")?;

    let services = BackendServices::initialise(&config)
        .await
        .context("failed to initialise backend services")?;

    let alice = services
        .authenticator
        .create_user("alice@example.com", "Alice")
        .await
        .context("failed to create demo user alice")?;
    let bob = services
        .authenticator
        .create_user("bob@example.com", "Bob")
        .await
        .context("failed to create demo user bob")?;

    let conversations = ConversationRepository::new(services.db_pool.clone());
    let conversation = conversations
        .create("Garden cleanup volunteers", alice.id)
        .await
        .context("failed to create demo conversation")?;

    services
        .participants
        .add_participant(
            &conversation.public_id,
            &alice.public_id,
            ParticipantRole::Admin,
        )
        .await
        .context("failed to add alice to the conversation")?;
    services
        .participants
        .add_participant(
            &conversation.public_id,
            &bob.public_id,
            ParticipantRole::Member,
        )
        .await
        .context("failed to add bob to the conversation")?;

    services
        .messages
        .record(
            &conversation.public_id,
            alice.id,
            "Welcome! Saturday 10am at the community garden.",
        )
        .await
        .context("failed to record demo message")?;
    services
        .messages
        .record(&conversation.public_id, bob.id, "Count me in, I'll bring gloves.")
        .await
        .context("failed to record demo message")?;

    let alice_session = services.authenticator.mint_session(alice.id).await?;
    let bob_session = services.authenticator.mint_session(bob.id).await?;

    println!("Database seeded with demo data:");
    println!(
        "- conversation {} (2 participants, 2 messages)",
        conversation.public_id
    );
    println!("- {} token: {}", alice.display_name, alice_session.token);
    println!("- {} token: {}", bob.display_name, bob_session.token);
    println!("Connect with: /ws/conversations?token=<token>");

    Ok(())
}
