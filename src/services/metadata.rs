//! Schema Metadata Store
//!
//! Canonical, read-only description of the target database schema: tables,
//! columns, types, constraints, enumerated value domains and the foreign-key
//! graph. Loaded once at startup from a JSON file and shared process-wide.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// Schema Metadata Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    #[serde(rename = "type")]
    pub col_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distinct_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    /// Target in `table.column` form.
    pub references: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    #[serde(default)]
    pub description: String,
    pub columns: BTreeMap<String, ColumnMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub tables: BTreeMap<String, TableMeta>,
}

// ============================================================================
// Foreign-Key Graph
// ============================================================================

/// A single directed foreign-key edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkEdge {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Directed graph of the metadata-declared foreign-key references.
/// Used to discover join conditions between detected tables.
#[derive(Debug, Clone, Default)]
pub struct ForeignKeyGraph {
    edges: Vec<FkEdge>,
}

impl ForeignKeyGraph {
    fn from_metadata(metadata: &SchemaMetadata) -> Result<Self, MetadataError> {
        let mut edges = Vec::new();
        for (table_name, table) in &metadata.tables {
            for fk in &table.foreign_keys {
                let (to_table, to_column) = fk
                    .references
                    .split_once('.')
                    .ok_or_else(|| MetadataError::InvalidForeignKey {
                        table: table_name.clone(),
                        reference: fk.references.clone(),
                    })?;

                if !table.columns.contains_key(&fk.column) {
                    return Err(MetadataError::InvalidForeignKey {
                        table: table_name.clone(),
                        reference: format!("{} (unknown local column)", fk.column),
                    });
                }

                let target_has_column = metadata
                    .tables
                    .get(to_table)
                    .is_some_and(|t| t.columns.contains_key(to_column));
                if !target_has_column {
                    return Err(MetadataError::InvalidForeignKey {
                        table: table_name.clone(),
                        reference: fk.references.clone(),
                    });
                }

                edges.push(FkEdge {
                    from_table: table_name.clone(),
                    from_column: fk.column.clone(),
                    to_table: to_table.to_string(),
                    to_column: to_column.to_string(),
                });
            }
        }
        Ok(Self { edges })
    }

    pub fn edges(&self) -> &[FkEdge] {
        &self.edges
    }

    /// Edges whose source is `table`.
    pub fn edges_from<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a FkEdge> {
        self.edges.iter().filter(move |e| e.from_table == table)
    }

    /// Join condition between two tables if a direct edge exists in either
    /// direction, rendered as `t1.col = t2.col`.
    pub fn join_condition(&self, table1: &str, table2: &str) -> Option<String> {
        for edge in &self.edges {
            if edge.from_table == table1 && edge.to_table == table2 {
                return Some(format!(
                    "{}.{} = {}.{}",
                    edge.from_table, edge.from_column, edge.to_table, edge.to_column
                ));
            }
            if edge.from_table == table2 && edge.to_table == table1 {
                return Some(format!(
                    "{}.{} = {}.{}",
                    edge.from_table, edge.from_column, edge.to_table, edge.to_column
                ));
            }
        }
        None
    }
}

// ============================================================================
// Metadata Store
// ============================================================================

/// Process-wide, read-only schema metadata handle.
#[derive(Debug)]
pub struct MetadataStore {
    metadata: SchemaMetadata,
    fk_graph: ForeignKeyGraph,
}

impl MetadataStore {
    /// Load metadata from a JSON file. A missing or malformed file is a fatal
    /// startup error; per-request code never reloads.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MetadataError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let metadata: SchemaMetadata = serde_json::from_str(&content)?;
        Self::from_metadata(metadata)
    }

    pub fn from_metadata(metadata: SchemaMetadata) -> Result<Self, MetadataError> {
        if metadata.tables.is_empty() {
            return Err(MetadataError::Empty);
        }
        let fk_graph = ForeignKeyGraph::from_metadata(&metadata)?;
        tracing::info!(
            "Loaded schema metadata: {} tables, {} foreign-key edges",
            metadata.tables.len(),
            fk_graph.edges().len()
        );
        Ok(Self { metadata, fk_graph })
    }

    pub fn tables(&self) -> &BTreeMap<String, TableMeta> {
        &self.metadata.tables
    }

    pub fn table_names(&self) -> Vec<String> {
        self.metadata.tables.keys().cloned().collect()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.metadata.tables.contains_key(table)
    }

    pub fn table(&self, table: &str) -> Option<&TableMeta> {
        self.metadata.tables.get(table)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnMeta> {
        self.table(table).and_then(|t| t.columns.get(column))
    }

    /// Table name -> ordered column names, the shape the validator and
    /// generator consume.
    pub fn schema_map(&self) -> BTreeMap<String, Vec<String>> {
        self.metadata
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.columns.keys().cloned().collect()))
            .collect()
    }

    pub fn fk_graph(&self) -> &ForeignKeyGraph {
        &self.fk_graph
    }

    /// Enumerated value domain for a column, empty when unconstrained.
    pub fn distinct_values(&self, table: &str, column: &str) -> &[String] {
        self.column(table, column)
            .map(|c| c.distinct_values.as_slice())
            .unwrap_or(&[])
    }

    pub fn column_pattern(&self, table: &str, column: &str) -> Option<&str> {
        self.column(table, column).and_then(|c| c.pattern.as_deref())
    }

    pub fn table_description(&self, table: &str) -> &str {
        self.table(table).map(|t| t.description.as_str()).unwrap_or("")
    }

    /// A value is valid when the column has no declared domain or the value
    /// is a member of it.
    pub fn validate_value(&self, table: &str, column: &str, value: &str) -> bool {
        let values = self.distinct_values(table, column);
        values.is_empty() || values.iter().any(|v| v == value)
    }

    /// Highest numeric sample value for a column. Used by the planner to pick
    /// a sensible default threshold for vague magnitude words.
    pub fn sample_high(&self, table: &str, column: &str) -> Option<f64> {
        self.column(table, column)?
            .sample_values
            .iter()
            .filter_map(|v| v.as_f64())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Flattened textual rendering of the full schema, one table per block.
    /// Serves as the retriever's deterministic fallback and the base of the
    /// prompt's schema section.
    pub fn llm_context(&self) -> String {
        let mut context = Vec::new();
        for (table_name, table) in &self.metadata.tables {
            context.push(format!("Table '{}': {}", table_name, table.description));
            for (col_name, col) in &table.columns {
                let mut desc = vec![format!("- {} ({})", col_name, col.col_type)];
                if col.required {
                    desc.push("required".to_string());
                }
                if col.primary_key {
                    desc.push("primary key".to_string());
                }
                if !col.distinct_values.is_empty() {
                    desc.push(format!("values: {}", col.distinct_values.join(", ")));
                }
                if let Some(default) = &col.default {
                    desc.push(format!("default: {}", default));
                }
                context.push(desc.join(" "));
            }
            for fk in &table.foreign_keys {
                context.push(format!("- {} references {}", fk.column, fk.references));
            }
        }
        context.join("\n")
    }

    /// Single-table rendering for fallback chunks.
    pub fn table_context(&self, table_name: &str) -> Option<String> {
        let table = self.table(table_name)?;
        let mut lines = vec![format!("Table '{}': {}", table_name, table.description)];
        for (col_name, col) in &table.columns {
            let required = if col.required { " (required)" } else { "" };
            lines.push(format!("- {}: {}{}", col_name, col.col_type, required));
            if !col.distinct_values.is_empty() {
                lines.push(format!("  Valid values: {}", col.distinct_values.join(", ")));
            }
            if let Some(pattern) = &col.pattern {
                lines.push(format!("  Pattern: {}", pattern));
            }
        }
        if !table.foreign_keys.is_empty() {
            lines.push("Relationships:".to_string());
            for fk in &table.foreign_keys {
                lines.push(format!("- {} references {}", fk.column, fk.references));
            }
        }
        Some(lines.join("\n"))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to read metadata file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse metadata JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Metadata declares no tables")]
    Empty,

    #[error("Invalid foreign key in table {table}: {reference}")]
    InvalidForeignKey { table: String, reference: String },
}
