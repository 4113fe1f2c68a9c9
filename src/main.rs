use axum::{
    Router,
    routing::{get, post},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use askdb::config::Config;
use askdb::services::llm::OpenAiClient;
use askdb::services::metadata::MetadataStore;
use askdb::services::pipeline::{
    KeywordPlanner, LlmGenerator, PromptBuilder, QueryPipeline, ResultSummarizer, SchemaRetriever,
    SqlExecutor, SqlValidator,
};
use askdb::services::schema_index::ChromaIndex;
use askdb::{AppState, handlers};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real deployments set the environment directly
    let _ = dotenvy::dotenv();

    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // Keep the appender guard alive for the process lifetime
    let _guard = if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("askdb.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    };

    tracing::info!("AskDB starting up");
    tracing::info!("Configuration loaded successfully");

    // Fatal startup checks: metadata file and LLM credentials. Per-request
    // code never re-validates these.
    let metadata = Arc::new(MetadataStore::load(&config.metadata.path)?);
    tracing::info!("Schema metadata loaded from {}", config.metadata.path);

    let llm = Arc::new(OpenAiClient::from_config(&config.llm)?);
    tracing::info!("LLM client initialized with model {}", config.llm.model);

    let index = Arc::new(ChromaIndex::new(&config.vector_store));

    // The assistant only ever reads the target database
    let connect_options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;
    tracing::info!("Read-only database pool created for {}", config.database.path);

    let planner = Arc::new(KeywordPlanner::new(Arc::clone(&metadata)));
    let retriever = Arc::new(SchemaRetriever::new(
        Arc::clone(&metadata),
        llm.clone(),
        index,
        config.pipeline.top_k_schema,
    ));
    let validator = Arc::new(SqlValidator::new(Arc::clone(&metadata), pool.clone()));
    let prompt_builder = Arc::new(Mutex::new(PromptBuilder::new(
        Arc::clone(&metadata),
        config.pipeline.max_history,
    )));
    let generator = Arc::new(LlmGenerator::new(
        Arc::clone(&metadata),
        llm,
        validator.clone(),
        prompt_builder,
        config.llm.temperature,
        config.pipeline.max_llm_attempts,
        config.llm.max_tokens,
    ));
    let executor = Arc::new(SqlExecutor::new(pool.clone()));
    let summarizer = Arc::new(ResultSummarizer::new(Arc::clone(&metadata)));

    let pipeline = Arc::new(QueryPipeline::new(
        planner,
        retriever,
        generator,
        validator,
        executor,
        summarizer,
        config.pipeline.clone(),
    ));
    tracing::info!("Query pipeline assembled");

    let app_state = Arc::new(AppState { metadata, pipeline });

    let api_routes = Router::new()
        .route("/api/query", post(handlers::query::run_query))
        .route("/api/schema", get(handlers::query::get_schema))
        .route("/api/system/runtime_info", get(handlers::system::get_runtime_info))
        .with_state(app_state);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(api_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("AskDB is ready to serve requests");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
