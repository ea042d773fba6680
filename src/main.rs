use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use leadline::config::AgentConfig;
use leadline::embeddings::{Embedder, EmbeddingsClient};
use leadline::llm::{LlmClient, ReplyGenerator};
use leadline::orchestrator::TurnOrchestrator;
use leadline::retrieval::RetrievalEngine;
use leadline::server::{self, ServerState};
use leadline::store::ConversationStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,leadline=debug")),
        )
        .init();

    tracing::info!("Leadline starting...");

    let config = AgentConfig::load();
    if config.llm_api_key.is_none() {
        tracing::warn!(
            "No LLM API key configured; replies will use keyword fallbacks and retrieval will use recency"
        );
    }

    let store = Arc::new(ConversationStore::new(&config.database_path)?);
    let generator: Arc<dyn ReplyGenerator> = Arc::new(LlmClient::new(&config)?);
    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingsClient::new(&config)?);
    let retrieval = Arc::new(RetrievalEngine::new(
        store.clone(),
        embedder.clone(),
        config.retrieval.clone(),
    ));
    let orchestrator = Arc::new(TurnOrchestrator::new(
        store.clone(),
        generator,
        embedder.clone(),
        retrieval,
        config.context_max_chars,
        config.embedding_version.clone(),
    ));

    let auth = server::load_auth_config()?;
    server::serve(ServerState {
        orchestrator,
        store,
        auth,
        embedder,
        embedding_version: config.embedding_version.clone(),
    })
    .await
}
