//! LLM Data Models
//!
//! Generation options and the error taxonomy shared by every provider
//! implementation.

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    /// Optional system message prepended to the conversation.
    pub system_message: Option<String>,
    /// Ask the provider for a JSON object response when supported.
    pub json_response: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { temperature: 0.1, max_tokens: 512, system_message: None, json_response: true }
    }
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// LLM transport and parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API key not configured")]
    MissingApiKey,

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}
