use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gifparty::{
    api,
    config::ServerConfig,
    llm::{self, PromptGenerator},
    state::AppState,
    store::MemoryStore,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gifparty=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gifparty...");

    let config = ServerConfig::from_env();

    let store = MemoryStore::new();
    for username in &config.seed_users {
        let user = store.create_user(username).await;
        tracing::info!("Seeded user {} with token {}", user.username, user.token);
    }

    let llm_config = llm::LlmConfig::from_env();
    let prompts: Option<Arc<dyn PromptGenerator>> = match llm_config.build_manager() {
        Ok(manager) => {
            tracing::info!("LLM providers initialized successfully");
            Some(Arc::new(manager))
        }
        Err(e) => {
            tracing::warn!(
                "Failed to initialize LLM providers: {}. Games cannot start until one is configured.",
                e
            );
            None
        }
    };

    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState::new(Arc::new(store), prompts, config));
    let app = api::app(state);

    tracing::info!("Listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await
}
