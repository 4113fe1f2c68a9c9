//! API Data Models
//!
//! Plain-data request/response types shared by the handlers and the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One returned row: ordered column name -> typed value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Inbound question. `clarified_values` carries answers to clarifications a
/// prior response surfaced (e.g. `{"min_balance": 50000}`).
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub clarified_values: BTreeMap<String, serde_json::Value>,
}

/// A single ambiguity the planner wants resolved. Advisory: the pipeline
/// still produces a best-effort answer and the caller decides whether to
/// re-run with `clarified_values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub field: String,
    pub prompt: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Per-request observability accumulated across pipeline stages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub retries: u32,
    pub validator_fail_reasons: Vec<String>,
    pub executor_errors: Vec<String>,
    pub timings_ms: BTreeMap<String, u64>,
    pub generated_sql: Option<String>,
    pub final_sql: Option<String>,
    pub chosen_tables: Vec<String>,
    pub detected_capabilities: Vec<String>,
}

/// The result envelope returned for every question. `success == false` never
/// comes with a panic or transport error; the last remediation message is in
/// `error` and partial diagnostics are always present.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub suggestions: Vec<String>,
    pub clarifications: Vec<Clarification>,
    pub capabilities: Vec<String>,
    pub tables_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub diagnostics: Diagnostics,
}

/// Schema overview returned by `GET /api/schema`.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaOverview {
    pub tables: Vec<SchemaTable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaTable {
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
}
