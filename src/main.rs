use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use chat_stream_sync::agent::OllamaAgentService;
use chat_stream_sync::config::AppConfig;
use chat_stream_sync::db::{InMemoryMessageStore, MessageStore, PgMessageStore};
use chat_stream_sync::errors::AppError;
use chat_stream_sync::service::chat_service::ChatService;

const SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_stream_sync=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Message store ─────────────────────────────────────────────────────────
    let store: Arc<dyn MessageStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .map_err(AppError::DatabaseConnectionFailed)?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(AppError::MigrationFailed)?;

            info!("Database connection established and migrations applied");
            Arc::new(PgMessageStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; messages are kept in memory only");
            Arc::new(InMemoryMessageStore::new())
        }
    };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let agent = OllamaAgentService::new(&config.ollama_base_url, &config.ollama_model)?;
    let chat_service = ChatService::new(store, Arc::new(agent), config.streams.clone());
    chat_service.registry().spawn_sweeper(SWEEP_PERIOD);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/ (websocket at ws://{addr}/ws)");

    axum::serve(listener, chat_stream_sync::app(chat_service)).await?;
    Ok(())
}
