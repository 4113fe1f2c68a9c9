//! LLM Client - HTTP client for OpenAI-compatible APIs
//!
//! Uses reqwest to call chat completion and embedding endpoints. Compatible
//! with OpenAI, Azure OpenAI, DeepSeek and other OpenAI-compatible APIs.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::{GenerateOptions, LlmError};
use super::LanguageModel;
use crate::config::LlmConfig;

/// OpenAI-compatible HTTP client.
pub struct OpenAiClient {
    http_client: Client,
    api_base: String,
    api_key: String,
    model: String,
    embedding_model: String,
    timeout: Duration,
    /// Process-wide in-flight cap; tokio semaphores queue waiters FIFO, so
    /// concurrent requests contend fairly.
    permits: tokio::sync::Semaphore,
}

impl OpenAiClient {
    /// Build the client from config. The API key comes from the environment
    /// (`APP_LLM_API_KEY`, falling back to `OPENAI_API_KEY`); a missing key is
    /// a fatal startup error, never a per-request one.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var("APP_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| LlmError::MissingApiKey)?;
        Ok(Self::new(config, api_key))
    }

    pub fn new(config: &LlmConfig, api_key: String) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            permits: tokio::sync::Semaphore::new(config.max_concurrent_requests.max(1)),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout.as_secs())
        } else {
            LlmError::ApiError(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError(format!("API error {}: {}", status, error_text)));
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate_text(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::ApiError("client shut down".to_string()))?;

        let mut messages = Vec::new();
        if let Some(system) = &opts.system_message {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        messages.push(ChatMessage { role: "user".to_string(), content: prompt.to_string() });

        let chat_request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(opts.max_tokens),
            temperature: Some(opts.temperature),
            response_format: opts
                .json_response
                .then(|| ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", self.api_base);
        tracing::debug!("Calling LLM API: {} with model {}", url, self.model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let response = Self::check_status(response).await?;

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        if let Some(usage) = &chat_response.usage {
            tracing::debug!(
                "LLM usage: {} prompt tokens, {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::ParseError("Empty response from LLM".to_string()))?;

        Ok(content)
    }

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::ApiError("client shut down".to_string()))?;

        let request = EmbeddingRequest { model: self.embedding_model.clone(), input: texts.to_vec() };

        let url = format!("{}/embeddings", self.api_base);
        tracing::debug!("Calling embedding API: {} with model {}", url, self.embedding_model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let response = Self::check_status(response).await?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        if body.data.is_empty() {
            return Err(LlmError::ParseError("Empty embedding response".to_string()));
        }

        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
