//! AskDB Library
//!
//! Natural-language-to-SQL assistant backend: a six-stage query-resolution
//! pipeline (plan, retrieve, generate, validate, execute, summarize) behind a
//! small HTTP surface.

use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use services::metadata::MetadataStore;
pub use services::pipeline::QueryPipeline;

/// Application shared state
///
/// Design philosophy: keep it simple - Rust's type system IS our DI
/// container. All process-wide handles are wrapped in Arc for cheap cloning
/// and thread safety; per-request state never lives here.
#[derive(Clone)]
pub struct AppState {
    pub metadata: Arc<MetadataStore>,
    pub pipeline: Arc<QueryPipeline>,
}
