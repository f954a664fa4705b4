//! Concierge - interrupt-driven company information assistant
//!
//! Serves a checkpointed conversation flow that answers questions about a
//! company, offers deeper research and emails a company profile on request.

mod api;
mod classifier;
mod config;
mod db;
mod llm;
mod mailer;
mod retrieval;
mod runtime;
mod state_machine;
mod steps;
mod system_prompt;

use api::{create_router, AppState};
use classifier::{LlmExtractor, RuleExtractor};
use config::AppConfig;
use db::Database;
use llm::{EmbeddingService, LlmService, LoggingService, OpenAIService};
use mailer::{GmailMailer, LogMailer};
use retrieval::{EmptyRetriever, IndexRetriever};
use runtime::{
    DatabaseStorage, Extractor, FlowExecutor, LlmClient, Mailer, OfflineLlmClient, Retriever,
    ServiceLlmClient, SessionManager,
};
use state_machine::company_profile_flow;
use std::net::SocketAddr;
use std::sync::Arc;
use steps::StepRunner;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Step attempts before a failure is surfaced as unavailable
const MAX_STEP_ATTEMPTS: u32 = 2;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concierge=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Refuse to start on a malformed graph
    let graph = company_profile_flow()?;

    let (llm, extractor, embedder) = language_services(&config)?;
    let retriever: Arc<dyn Retriever> = match &config.index_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using chunk index");
            let index = IndexRetriever::new(path);
            match embedder {
                Some(embedder) => Arc::new(index.with_embedder(embedder)),
                None => Arc::new(index),
            }
        }
        None => {
            tracing::warn!("No CONCIERGE_INDEX_PATH set; answers will have no retrieved context");
            Arc::new(EmptyRetriever)
        }
    };
    let mailer: Arc<dyn Mailer> = match &config.gmail {
        Some(gmail) => Arc::new(GmailMailer::new(
            gmail.access_token.clone(),
            gmail.sender.clone(),
            gmail.cc.clone(),
            config.collaborator_timeout,
        )?),
        None => {
            tracing::warn!("Gmail not configured; profile emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let steps = StepRunner::new(llm, extractor, retriever, mailer, config.step_config());
    let executor = FlowExecutor::new(graph, DatabaseStorage::new(db.clone()), steps)
        .with_retry_policy(MAX_STEP_ATTEMPTS, config.retry_base_delay);
    let state = AppState::new(SessionManager::new(executor), db);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Concierge server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

type LanguageServices = (
    Arc<dyn LlmClient>,
    Arc<dyn Extractor>,
    Option<Arc<dyn EmbeddingService>>,
);

fn language_services(config: &AppConfig) -> Result<LanguageServices, llm::LlmError> {
    let Some(api_key) = config.openai_api_key.clone() else {
        tracing::warn!("No OPENAI_API_KEY configured; running with canned replies");
        let llm: Arc<dyn LlmClient> = Arc::new(OfflineLlmClient);
        let extractor: Arc<dyn Extractor> = Arc::new(RuleExtractor);
        return Ok((llm, extractor, None));
    };

    let openai = Arc::new(OpenAIService::new(
        api_key,
        config.openai_base_url.as_deref(),
        &config.model,
        &config.embedding_model,
        config.collaborator_timeout,
    )?);
    tracing::info!(model = %openai.model_id(), "LLM service initialized");

    let service: Arc<dyn LlmService> = Arc::new(LoggingService::new(openai.clone()));
    let llm: Arc<dyn LlmClient> = Arc::new(ServiceLlmClient::new(service));
    let extractor: Arc<dyn Extractor> = Arc::new(LlmExtractor::new(Arc::clone(&llm)));
    let embedder: Arc<dyn EmbeddingService> = openai;
    Ok((llm, extractor, Some(embedder)))
}
