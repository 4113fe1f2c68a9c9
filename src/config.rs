use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub metadata: MetadataConfig,
    pub vector_store: VectorStoreConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database the assistant answers questions against.
    /// Opened read-only; this service never writes to it.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Path to the schema metadata JSON file.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// Base URL of the Chroma-compatible vector store HTTP API.
    pub url: String,
    /// Collection holding the schema chunk embeddings.
    pub collection: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible API base, e.g. https://api.openai.com/v1
    pub api_base: String,
    pub model: String,
    pub embedding_model: String,
    /// Base sampling temperature; generation attempts ramp up from here.
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Process-wide cap on in-flight LLM/embedding calls; waiters are served
    /// in FIFO order.
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Repair attempts after the first generation (validator/executor loop).
    pub max_retries: u32,
    /// Row cap applied to every successful result.
    pub sql_row_limit: usize,
    /// LLM attempts inside a single generate/repair call.
    pub max_llm_attempts: u32,
    /// Bounded ring of prior queries kept by the prompt builder.
    pub max_history: usize,
    /// Top-K schema chunks fetched from the vector store.
    pub top_k_schema: usize,
    /// Global wall-clock budget for one request; stages inherit sub-budgets.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "askdb")]
#[command(version, about = "AskDB - Natural Language to SQL Assistant Backend")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// SQLite database path (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub database_path: Option<String>,

    /// Schema metadata JSON path (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub metadata_path: Option<String>,

    /// Vector store base URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub vector_store_url: Option<String>,

    /// LLM model name (overrides config file)
    #[arg(long, value_name = "MODEL")]
    pub llm_model: Option<String>,

    /// Logging level (overrides config file, e.g., "info,askdb=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT
    /// - APP_DATABASE_PATH: SQLite database path
    /// - APP_METADATA_PATH: schema metadata JSON path
    /// - APP_VECTOR_STORE_URL / APP_VECTOR_STORE_COLLECTION
    /// - APP_LLM_API_BASE / APP_LLM_MODEL / APP_LLM_EMBEDDING_MODEL
    /// - APP_LOG_LEVEL
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(path) = std::env::var("APP_DATABASE_PATH") {
            self.database.path = path;
            tracing::info!("Override database.path from env");
        }

        if let Ok(path) = std::env::var("APP_METADATA_PATH") {
            self.metadata.path = path;
            tracing::info!("Override metadata.path from env");
        }

        if let Ok(url) = std::env::var("APP_VECTOR_STORE_URL") {
            self.vector_store.url = url;
            tracing::info!("Override vector_store.url from env");
        }

        if let Ok(collection) = std::env::var("APP_VECTOR_STORE_COLLECTION") {
            self.vector_store.collection = collection;
            tracing::info!("Override vector_store.collection from env");
        }

        if let Ok(base) = std::env::var("APP_LLM_API_BASE") {
            self.llm.api_base = base;
            tracing::info!("Override llm.api_base from env");
        }

        if let Ok(model) = std::env::var("APP_LLM_MODEL") {
            self.llm.model = model;
            tracing::info!("Override llm.model from env: {}", self.llm.model);
        }

        if let Ok(model) = std::env::var("APP_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = model;
            tracing::info!("Override llm.embedding_model from env: {}", self.llm.embedding_model);
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(path) = &args.database_path {
            self.database.path = path.clone();
            tracing::info!("Override database.path from CLI");
        }

        if let Some(path) = &args.metadata_path {
            self.metadata.path = path.clone();
            tracing::info!("Override metadata.path from CLI");
        }

        if let Some(url) = &args.vector_store_url {
            self.vector_store.url = url.clone();
            tracing::info!("Override vector_store.url from CLI");
        }

        if let Some(model) = &args.llm_model {
            self.llm.model = model.clone();
            tracing::info!("Override llm.model from CLI: {}", self.llm.model);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.path.is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }

        if self.metadata.path.is_empty() {
            anyhow::bail!("Metadata path cannot be empty");
        }

        if self.pipeline.sql_row_limit == 0 {
            anyhow::bail!("pipeline.sql_row_limit must be > 0");
        }

        if self.pipeline.max_llm_attempts == 0 {
            anyhow::bail!("pipeline.max_llm_attempts must be > 0");
        }

        if self.pipeline.request_timeout_secs == 0 {
            anyhow::bail!("pipeline.request_timeout_secs must be > 0");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "data/banking.db".to_string() }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { path: "data/metadata.json".to_string() }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            collection: "database_schema".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            temperature: 0.1,
            max_tokens: 512,
            timeout_seconds: 60,
            max_concurrent_requests: 4,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            sql_row_limit: 200,
            max_llm_attempts: 3,
            max_history: 3,
            top_k_schema: 3,
            request_timeout_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,askdb=debug".to_string(),
            file: Some("logs/askdb.log".to_string()),
        }
    }
}
