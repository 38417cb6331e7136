use finance_assistant::{
    api::start_server,
    context::ContextAssembler,
    engine::GeminiEngine,
    executor::ToolExecutor,
    history::{ChatHistoryStore, InMemoryChatHistoryStore, PgChatHistoryStore},
    orchestrator::Orchestrator,
    store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore},
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let gemini_api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        eprintln!("GEMINI_API_KEY not set; engine calls will fail until configured");
        String::new()
    });

    let port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Finance Assistant - API server");
    info!("Port: {}", port);

    // Stores are built once here and passed by handle. With no database
    // configured the server runs against in-memory stores.
    let (ledger, history): (Arc<dyn LedgerStore>, Arc<dyn ChatHistoryStore>) =
        match std::env::var("DATABASE_URL").ok() {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(5)
                    .connect_lazy(&url)?;
                info!("Persistence backend: postgres");
                (
                    Arc::new(PgLedgerStore::new(pool.clone())),
                    Arc::new(PgChatHistoryStore::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory stores");
                (
                    Arc::new(InMemoryLedgerStore::new()),
                    Arc::new(InMemoryChatHistoryStore::new()),
                )
            }
        };

    let engine = GeminiEngine::new(gemini_api_key)?;
    let orchestrator = Arc::new(Orchestrator::new(
        ContextAssembler::new(ledger.clone()),
        ToolExecutor::new(ledger),
        Box::new(engine),
        history.clone(),
    ));

    info!("Orchestrator initialized; starting API server");

    start_server(orchestrator, history, port).await?;

    Ok(())
}
