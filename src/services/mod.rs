pub mod llm;
pub mod metadata;
pub mod pipeline;
pub mod schema_index;

pub use llm::{GenerateOptions, LanguageModel, LlmError, OpenAiClient};
pub use metadata::{ForeignKeyGraph, MetadataError, MetadataStore};
pub use pipeline::QueryPipeline;
pub use schema_index::{ChromaIndex, IndexError, IndexMatches, SchemaIndex};
