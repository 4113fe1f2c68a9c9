//! LLM Provider Module
//!
//! Generic text-generation and embedding capability consumed by the pipeline.
//! The `LanguageModel` trait is the seam: production wires the
//! OpenAI-compatible HTTP client, tests inject scripted fakes.

mod client;
mod models;

pub use client::OpenAiClient;
pub use models::{GenerateOptions, LlmError};

use async_trait::async_trait;

/// Language model capability set.
///
/// `generate_text` returning `Err` means the call failed after the client's
/// own handling; the caller counts it as one attempt and may retry.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(&self, prompt: &str, opts: &GenerateOptions)
    -> Result<String, LlmError>;

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}
