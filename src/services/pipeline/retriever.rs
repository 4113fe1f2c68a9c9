//! Retriever - schema context assembly
//!
//! Embeds the retrieval query, pulls the top-K schema chunks from the vector
//! index, and enriches them with enumerated value hints and worked exemplars.
//! When the index or the embedding call is degraded the retriever synthesizes
//! chunks straight from the metadata store, so the pipeline always has a
//! grounded schema context to hand the generator.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::prompt::{QueryExample, example_corpus};
use crate::services::llm::LanguageModel;
use crate::services::metadata::MetadataStore;
use crate::services::schema_index::SchemaIndex;
use crate::utils::unique_ordered;

/// Compact schema context handed to the generator.
#[derive(Debug, Clone, Default)]
pub struct RetrievalBundle {
    /// Relevant schema text, ordered by match relevance.
    pub schema_chunks: Vec<String>,
    /// Qualified column -> declared enum values for the matched tables.
    pub value_hints: BTreeMap<String, Vec<String>>,
    /// Worked examples whose tables overlap the matched tables.
    pub exemplars: Vec<QueryExample>,
    /// Matched tables, unique, preserving match order.
    pub tables_found: Vec<String>,
}

/// Retrieval capability.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Always returns; backend failures degrade to the metadata fallback.
    async fn fetch(&self, retrieval_query: &str) -> RetrievalBundle;
}

/// The retrieval query format the schema index was built for.
pub fn build_retrieval_query(question: &str, tables: &[String]) -> String {
    format!("tables: {} query: {}", tables.join(" "), question)
}

pub struct SchemaRetriever {
    metadata: Arc<MetadataStore>,
    llm: Arc<dyn LanguageModel>,
    index: Arc<dyn SchemaIndex>,
    top_k: usize,
}

impl SchemaRetriever {
    pub fn new(
        metadata: Arc<MetadataStore>,
        llm: Arc<dyn LanguageModel>,
        index: Arc<dyn SchemaIndex>,
        top_k: usize,
    ) -> Self {
        Self { metadata, llm, index, top_k }
    }

    async fn fetch_from_index(&self, retrieval_query: &str) -> Option<RetrievalBundle> {
        let embeddings = self
            .llm
            .generate_embeddings(&[retrieval_query.to_string()])
            .await
            .map_err(|e| tracing::warn!("Embedding call failed: {}", e))
            .ok()?;
        let embedding = embeddings.first()?;

        let matches = self
            .index
            .query(embedding, self.top_k)
            .await
            .map_err(|e| tracing::warn!("Schema index query failed: {}", e))
            .ok()?;

        if matches.is_empty() {
            tracing::warn!("Schema index returned no chunks, using metadata fallback");
            return None;
        }

        let mut schema_chunks = matches.documents.clone();
        let tables_found = unique_ordered(
            matches
                .metadatas
                .iter()
                .filter_map(|m| m.get("table").cloned())
                .filter(|t| self.metadata.has_table(t))
                .collect(),
        );

        let mut value_hints = BTreeMap::new();
        for table in &tables_found {
            let Some(meta) = self.metadata.table(table) else { continue };
            let mut hint_lines = Vec::new();
            for (col_name, col) in &meta.columns {
                if col.distinct_values.is_empty() {
                    continue;
                }
                hint_lines
                    .push(format!("- {}: Valid values = {}", col_name, col.distinct_values.join(", ")));
                value_hints
                    .insert(format!("{}.{}", table, col_name), col.distinct_values.clone());
            }
            if !hint_lines.is_empty() {
                schema_chunks.push(format!("\nTable '{}' metadata:", table));
                schema_chunks.extend(hint_lines);
            }
        }

        tracing::debug!("Retrieved schema context for tables: {}", tables_found.join(", "));

        Some(RetrievalBundle {
            schema_chunks,
            value_hints,
            exemplars: exemplars_for(&tables_found),
            tables_found,
        })
    }

    /// Deterministic fallback built from the metadata store, one chunk per
    /// table, with the same value hints the live path would add.
    fn fallback_bundle(&self) -> RetrievalBundle {
        let tables_found = self.metadata.table_names();

        let mut schema_chunks = Vec::new();
        let mut value_hints = BTreeMap::new();
        for table in &tables_found {
            if let Some(chunk) = self.metadata.table_context(table) {
                schema_chunks.push(chunk);
            }
            let Some(meta) = self.metadata.table(table) else { continue };
            for (col_name, col) in &meta.columns {
                if !col.distinct_values.is_empty() {
                    value_hints
                        .insert(format!("{}.{}", table, col_name), col.distinct_values.clone());
                }
            }
        }

        tracing::debug!("Fallback schema context prepared with {} tables", tables_found.len());

        RetrievalBundle {
            schema_chunks,
            value_hints,
            exemplars: exemplars_for(&tables_found),
            tables_found,
        }
    }
}

#[async_trait]
impl Retriever for SchemaRetriever {
    async fn fetch(&self, retrieval_query: &str) -> RetrievalBundle {
        tracing::debug!("Retriever called with query: {}", retrieval_query);
        match self.fetch_from_index(retrieval_query).await {
            Some(bundle) => bundle,
            None => self.fallback_bundle(),
        }
    }
}

/// Corpus examples whose tables overlap the matched tables.
fn exemplars_for(tables: &[String]) -> Vec<QueryExample> {
    example_corpus()
        .iter()
        .filter(|ex| ex.tables_used.iter().any(|t| tables.iter().any(|d| d == t)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::{GenerateOptions, LlmError};
    use crate::services::metadata::SchemaMetadata;
    use crate::services::schema_index::{IndexError, IndexMatches};

    struct FixedEmbedder;

    #[async_trait]
    impl LanguageModel for FixedEmbedder {
        async fn generate_text(
            &self,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<String, LlmError> {
            Err(LlmError::ApiError("not used".to_string()))
        }

        async fn generate_embeddings(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl LanguageModel for FailingEmbedder {
        async fn generate_text(
            &self,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<String, LlmError> {
            Err(LlmError::ApiError("down".to_string()))
        }

        async fn generate_embeddings(
            &self,
            _texts: &[String],
        ) -> Result<Vec<Vec<f32>>, LlmError> {
            Err(LlmError::Timeout(10))
        }
    }

    struct FixedIndex {
        matches: IndexMatches,
    }

    #[async_trait]
    impl SchemaIndex for FixedIndex {
        async fn query(
            &self,
            _embedding: &[f32],
            _top_k: usize,
        ) -> Result<IndexMatches, IndexError> {
            Ok(self.matches.clone())
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl SchemaIndex for BrokenIndex {
        async fn query(
            &self,
            _embedding: &[f32],
            _top_k: usize,
        ) -> Result<IndexMatches, IndexError> {
            Err(IndexError::Backend("connection refused".to_string()))
        }
    }

    fn store() -> Arc<MetadataStore> {
        let metadata: SchemaMetadata =
            serde_json::from_str(include_str!("../../../data/metadata.json")).unwrap();
        Arc::new(MetadataStore::from_metadata(metadata).unwrap())
    }

    fn account_matches() -> IndexMatches {
        IndexMatches {
            documents: vec![
                "Table 'accounts': customer accounts".to_string(),
                "Table 'customers': bank customers".to_string(),
            ],
            metadatas: vec![
                [("table".to_string(), "accounts".to_string())].into_iter().collect(),
                [("table".to_string(), "customers".to_string())].into_iter().collect(),
            ],
        }
    }

    #[test]
    fn retrieval_query_format() {
        let query = build_retrieval_query(
            "both checking and savings",
            &["customers".to_string(), "accounts".to_string()],
        );
        assert_eq!(query, "tables: customers accounts query: both checking and savings");
    }

    #[tokio::test]
    async fn live_path_appends_value_hints() {
        let retriever = SchemaRetriever::new(
            store(),
            Arc::new(FixedEmbedder),
            Arc::new(FixedIndex { matches: account_matches() }),
            3,
        );
        let bundle = retriever.fetch("tables: accounts query: balances").await;
        assert_eq!(bundle.tables_found, vec!["accounts", "customers"]);
        assert!(
            bundle
                .schema_chunks
                .iter()
                .any(|c| c.contains("Valid values = checking, savings, credit"))
        );
        assert_eq!(
            bundle.value_hints.get("accounts.type").map(Vec::as_slice),
            Some(&["checking".to_string(), "savings".to_string(), "credit".to_string()][..])
        );
        // Exemplars overlap the matched tables
        assert!(!bundle.exemplars.is_empty());
        assert!(
            bundle
                .exemplars
                .iter()
                .all(|ex| ex.tables_used.iter().any(|t| bundle.tables_found.iter().any(|d| d == t)))
        );
    }

    #[tokio::test]
    async fn index_error_falls_back_to_metadata() {
        let retriever =
            SchemaRetriever::new(store(), Arc::new(FixedEmbedder), Arc::new(BrokenIndex), 3);
        let bundle = retriever.fetch("tables: accounts query: anything").await;
        assert_eq!(bundle.tables_found.len(), 5);
        assert!(bundle.schema_chunks.iter().any(|c| c.contains("Table 'branches'")));
        assert!(bundle.value_hints.contains_key("employees.position"));
    }

    #[tokio::test]
    async fn embedding_error_falls_back_to_metadata() {
        let retriever = SchemaRetriever::new(
            store(),
            Arc::new(FailingEmbedder),
            Arc::new(FixedIndex { matches: account_matches() }),
            3,
        );
        let bundle = retriever.fetch("tables: accounts query: anything").await;
        assert_eq!(bundle.tables_found.len(), 5);
    }

    #[tokio::test]
    async fn empty_index_result_falls_back() {
        let retriever = SchemaRetriever::new(
            store(),
            Arc::new(FixedEmbedder),
            Arc::new(FixedIndex { matches: IndexMatches::default() }),
            3,
        );
        let bundle = retriever.fetch("tables: accounts query: anything").await;
        assert!(!bundle.schema_chunks.is_empty());
        assert_eq!(bundle.tables_found.len(), 5);
    }

    #[tokio::test]
    async fn duplicate_table_matches_deduplicated() {
        let matches = IndexMatches {
            documents: vec!["a".to_string(), "b".to_string()],
            metadatas: vec![
                [("table".to_string(), "accounts".to_string())].into_iter().collect(),
                [("table".to_string(), "accounts".to_string())].into_iter().collect(),
            ],
        };
        let retriever = SchemaRetriever::new(
            store(),
            Arc::new(FixedEmbedder),
            Arc::new(FixedIndex { matches }),
            3,
        );
        let bundle = retriever.fetch("q").await;
        assert_eq!(bundle.tables_found, vec!["accounts"]);
    }
}
