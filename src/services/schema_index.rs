//! Schema Index - vector-searchable index of schema chunks
//!
//! Thin client over a Chroma-compatible HTTP API. The `SchemaIndex` trait is
//! the seam the retriever depends on; any backend failure routes the caller
//! to its deterministic metadata fallback.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::VectorStoreConfig;

/// Matches returned from the index, aligned by position.
#[derive(Debug, Clone, Default)]
pub struct IndexMatches {
    pub documents: Vec<String>,
    pub metadatas: Vec<BTreeMap<String, String>>,
}

impl IndexMatches {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Vector store error: {0}")]
    Backend(String),

    #[error("Vector store returned malformed response: {0}")]
    Malformed(String),
}

/// Vector index capability consumed by the retriever.
#[async_trait]
pub trait SchemaIndex: Send + Sync {
    /// Nearest `top_k` schema chunks for a query embedding.
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<IndexMatches, IndexError>;
}

// ============================================================================
// Chroma HTTP Implementation
// ============================================================================

/// Client for a Chroma-style REST API. The collection id is resolved lazily
/// on first query and cached for the process lifetime.
pub struct ChromaIndex {
    http_client: Client,
    base_url: String,
    collection_name: String,
    collection_id: tokio::sync::OnceCell<String>,
}

impl ChromaIndex {
    pub fn new(config: &VectorStoreConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection_name: config.collection.clone(),
            collection_id: tokio::sync::OnceCell::new(),
        }
    }

    async fn resolve_collection_id(&self) -> Result<&str, IndexError> {
        self.collection_id
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/api/v1/collections/{}",
                    self.base_url, self.collection_name
                );
                let response = self
                    .http_client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| IndexError::Backend(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(IndexError::Backend(format!(
                        "Collection lookup failed with status {}",
                        response.status()
                    )));
                }

                let collection: CollectionResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::Malformed(e.to_string()))?;
                Ok(collection.id)
            })
            .await
            .map(String::as_str)
    }
}

#[async_trait]
impl SchemaIndex for ChromaIndex {
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<IndexMatches, IndexError> {
        let collection_id = self.resolve_collection_id().await?;

        let url = format!("{}/api/v1/collections/{}/query", self.base_url, collection_id);
        let request = QueryRequest {
            query_embeddings: vec![embedding.to_vec()],
            n_results: top_k,
            include: vec!["documents".to_string(), "metadatas".to_string()],
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| IndexError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IndexError::Backend(format!(
                "Query failed with status {}",
                response.status()
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Malformed(e.to_string()))?;

        // Results come nested one list per query embedding; we send one.
        let documents = body.documents.into_iter().next().unwrap_or_default();
        let metadatas = body
            .metadatas
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                m.unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, json_value_to_string(v)))
                    .collect()
            })
            .collect();

        Ok(IndexMatches { documents, metadatas })
    }
}

fn json_value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

// ============================================================================
// Chroma API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest {
    query_embeddings: Vec<Vec<f32>>,
    n_results: usize,
    include: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<String>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<BTreeMap<String, serde_json::Value>>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_response_tolerates_missing_fields() {
        let body: QueryResponse = serde_json::from_str("{}").expect("Failed to parse");
        assert!(body.documents.is_empty());
        assert!(body.metadatas.is_empty());
    }

    #[test]
    fn metadata_values_flatten_to_strings() {
        assert_eq!(json_value_to_string(serde_json::json!("accounts")), "accounts");
        assert_eq!(json_value_to_string(serde_json::json!(3)), "3");
    }
}
