//! Query Handlers
//!
//! The assistant's inbound surface: one question in, one result envelope out,
//! plus a schema overview for callers that want to show what can be asked.

use axum::{Json, extract::State};
use std::sync::Arc;

use crate::AppState;
use crate::models::{PipelineResult, QueryRequest, SchemaOverview, SchemaTable};

/// Run one question through the pipeline.
/// POST /api/query
///
/// Never fails at the HTTP layer: pipeline errors come back inside the
/// envelope with `success = false`.
pub async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Json<PipelineResult> {
    let result = state.pipeline.run(&req.question, req.clarified_values).await;
    Json(result)
}

/// Describe the known schema.
/// GET /api/schema
pub async fn get_schema(State(state): State<Arc<AppState>>) -> Json<SchemaOverview> {
    let tables = state
        .metadata
        .tables()
        .iter()
        .map(|(name, table)| SchemaTable {
            name: name.clone(),
            description: table.description.clone(),
            columns: table.columns.keys().cloned().collect(),
        })
        .collect();
    Json(SchemaOverview { tables })
}
