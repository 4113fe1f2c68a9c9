//! SQL Executor - read-only execution with a row cap
//!
//! Runs a validated statement against the database and returns rows as
//! ordered column-name -> value records. Statements without a row-limiting
//! clause get the configured cap appended; results are truncated to the cap
//! either way.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as SqlxRow, SqlitePool};

use crate::models::Row;

/// Row set plus status for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub rows: Vec<Row>,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Execution capability.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        sql: &str,
        limit: usize,
        validation: &super::validator::ValidationOutcome,
    ) -> ExecutionOutcome;
}

pub struct SqlExecutor {
    pool: SqlitePool,
}

impl SqlExecutor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Executor for SqlExecutor {
    async fn run(
        &self,
        sql: &str,
        limit: usize,
        validation: &super::validator::ValidationOutcome,
    ) -> ExecutionOutcome {
        if !validation.is_valid {
            return ExecutionOutcome {
                success: false,
                error: Some("Query failed validation".to_string()),
                ..Default::default()
            };
        }

        let trimmed = sql.trim().trim_end_matches(';').trim();
        let bounded = if trimmed.to_uppercase().contains("LIMIT") {
            trimmed.to_string()
        } else {
            format!("{} LIMIT {}", trimmed, limit)
        };

        match sqlx::query(&bounded).fetch_all(&self.pool).await {
            Ok(rows) => {
                let records: Vec<Row> =
                    rows.iter().take(limit).map(row_to_record).collect();
                if records.is_empty() {
                    ExecutionOutcome {
                        success: true,
                        rows: Vec::new(),
                        message: Some("No results found".to_string()),
                        error: None,
                    }
                } else {
                    ExecutionOutcome { success: true, rows: records, message: None, error: None }
                }
            },
            Err(e) => {
                let error = e.to_string();
                tracing::warn!("Execution failed: {}", error);
                ExecutionOutcome { success: false, error: Some(error), ..Default::default() }
            },
        }
    }
}

/// Decode one SQLite row into an ordered record. SQLite's dynamic typing is
/// resolved by trying integer, real, text and blob in that order; NULLs of
/// any affinity decode to JSON null.
pub(crate) fn row_to_record(row: &SqliteRow) -> Row {
    let mut record = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            v.map(|bytes| {
                serde_json::Value::String(
                    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>(),
                )
            })
            .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        record.insert(column.name().to_string(), value);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::super::validator::ValidationOutcome;
    use super::*;

    async fn seeded_pool(rows: usize) -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");

        sqlx::query(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, type TEXT NOT NULL, balance REAL NOT NULL)",
        )
        .execute(&pool)
        .await
        .expect("Failed to create accounts");

        for i in 0..rows {
            sqlx::query("INSERT INTO accounts (type, balance) VALUES (?, ?)")
                .bind(if i % 2 == 0 { "checking" } else { "savings" })
                .bind(100.0 + i as f64)
                .execute(&pool)
                .await
                .expect("Failed to seed");
        }

        pool
    }

    fn valid_context() -> ValidationOutcome {
        ValidationOutcome {
            is_valid: true,
            error: None,
            tables_used: vec!["accounts".to_string()],
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn refuses_invalid_validation_context() {
        let executor = SqlExecutor::new(seeded_pool(3).await);
        let invalid = ValidationOutcome::default();
        let outcome = executor.run("SELECT * FROM accounts", 10, &invalid).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Query failed validation"));
        assert!(outcome.rows.is_empty());
    }

    #[tokio::test]
    async fn applies_row_cap_when_no_limit_present() {
        let executor = SqlExecutor::new(seeded_pool(250).await);
        let outcome = executor.run("SELECT * FROM accounts", 200, &valid_context()).await;
        assert!(outcome.success);
        assert_eq!(outcome.rows.len(), 200);
    }

    #[tokio::test]
    async fn truncates_past_cap_even_with_explicit_limit() {
        let executor = SqlExecutor::new(seeded_pool(50).await);
        let outcome = executor
            .run("SELECT * FROM accounts LIMIT 40", 10, &valid_context())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.rows.len(), 10);
    }

    #[tokio::test]
    async fn empty_result_is_success_with_message() {
        let executor = SqlExecutor::new(seeded_pool(3).await);
        let outcome = executor
            .run("SELECT * FROM accounts WHERE type = 'credit'", 10, &valid_context())
            .await;
        assert!(outcome.success);
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.message.as_deref(), Some("No results found"));
    }

    #[tokio::test]
    async fn rows_decode_with_column_names_and_types() {
        let executor = SqlExecutor::new(seeded_pool(1).await);
        let outcome = executor
            .run("SELECT id, type, balance FROM accounts", 10, &valid_context())
            .await;
        assert!(outcome.success);
        let row = &outcome.rows[0];
        assert_eq!(row["id"], serde_json::json!(1));
        assert_eq!(row["type"], serde_json::json!("checking"));
        assert_eq!(row["balance"], serde_json::json!(100.0));
    }

    #[tokio::test]
    async fn engine_error_propagated_verbatim() {
        let executor = SqlExecutor::new(seeded_pool(1).await);
        let outcome = executor
            .run("SELECT missing_col FROM accounts", 10, &valid_context())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("missing_col"));
    }
}
