//! SQL Validator - the read-only safety gate
//!
//! Every candidate SQL passes through here before it may touch the database:
//! statement-shape checks, a forbidden-keyword scan over literal-stripped
//! text, identifier existence against the schema, and finally a LIMIT 1 smoke
//! execution. Only statements whose first significant token is a read-only
//! verb ever reach the engine.

use async_trait::async_trait;
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::metadata::MetadataStore;
use crate::utils::unique_ordered;

/// Statement verdict handed to the executor and the repair loop.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub error: Option<String>,
    pub tables_used: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    fn invalid(error: impl Into<String>) -> Self {
        Self { is_valid: false, error: Some(error.into()), ..Default::default() }
    }
}

/// Validation capability.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, sql: &str) -> ValidationOutcome;
}

// ============================================================================
// Error Taxonomy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    TableNotFound,
    ColumnNotFound,
    AmbiguousColumn,
    Syntax,
    Unknown,
}

impl SqlErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableNotFound => "table_not_found",
            Self::ColumnNotFound => "column_not_found",
            Self::AmbiguousColumn => "ambiguous_column",
            Self::Syntax => "syntax_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Remediation context computed from an engine or validator message, rendered
/// into the repair prompt.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error_type: SqlErrorKind,
    pub suggestion: String,
    pub examples: Vec<String>,
}

impl ErrorContext {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("no such table") || lower.contains("unknown table") {
            Self {
                error_type: SqlErrorKind::TableNotFound,
                suggestion: "Check table names and ensure they exist in the schema".to_string(),
                examples: vec![
                    "FROM customers c".to_string(),
                    "JOIN accounts a ON c.id = a.customer_id".to_string(),
                ],
            }
        } else if lower.contains("no such column") || lower.contains("does not exist") {
            Self {
                error_type: SqlErrorKind::ColumnNotFound,
                suggestion: "Verify column names and table aliases".to_string(),
                examples: vec![
                    "SELECT c.first_name, c.last_name, a.account_number".to_string(),
                    "WHERE a.status = 'active'".to_string(),
                ],
            }
        } else if lower.contains("ambiguous") {
            Self {
                error_type: SqlErrorKind::AmbiguousColumn,
                suggestion: "Use table aliases to qualify column names".to_string(),
                examples: vec![
                    "SELECT c.id AS customer_id, a.id AS account_id".to_string(),
                    "ON c.branch_id = b.id".to_string(),
                ],
            }
        } else if lower.contains("syntax error") {
            Self {
                error_type: SqlErrorKind::Syntax,
                suggestion: "Check SQL syntax, especially JOINs and conditions".to_string(),
                examples: vec![
                    "LEFT JOIN branches b ON c.branch_id = b.id".to_string(),
                    "WHERE a.type IN ('checking', 'savings')".to_string(),
                ],
            }
        } else {
            Self {
                error_type: SqlErrorKind::Unknown,
                suggestion: "Please review the query syntax".to_string(),
                examples: Vec::new(),
            }
        }
    }
}

// ============================================================================
// SQL Validator
// ============================================================================

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "UPDATE", "INSERT", "ALTER", "CREATE", "MODIFY", "RENAME",
    "REPLACE", "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA",
];

pub struct SqlValidator {
    metadata: Arc<MetadataStore>,
    pool: SqlitePool,
    read_verb: Regex,
    forbidden: Regex,
    from_join_ident: Regex,
    cte_name: Regex,
}

impl SqlValidator {
    pub fn new(metadata: Arc<MetadataStore>, pool: SqlitePool) -> Self {
        let forbidden_pattern = format!(r"(?i)\b(?:{})\b", FORBIDDEN_KEYWORDS.join("|"));
        Self {
            metadata,
            pool,
            read_verb: Regex::new(r"(?is)^\s*(SELECT|WITH)\b").expect("invalid verb regex"),
            forbidden: Regex::new(&forbidden_pattern).expect("invalid keyword regex"),
            from_join_ident: Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)")
                .expect("invalid identifier regex"),
            cte_name: Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(")
                .expect("invalid cte regex"),
        }
    }

    /// Run the statement with an appended LIMIT 1 to surface identifier and
    /// syntax problems before real execution. Idempotent for read-only verbs.
    async fn smoke_execute(&self, sql: &str) -> Result<(), String> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        let test_sql = if trimmed.to_uppercase().contains("LIMIT") {
            trimmed.to_string()
        } else {
            format!("{} LIMIT 1", trimmed)
        };

        sqlx::query(&test_sql)
            .fetch_all(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| format!("SQL execution error: {}", e))
    }
}

#[async_trait]
impl Validator for SqlValidator {
    async fn validate(&self, sql: &str) -> ValidationOutcome {
        let sql = sql.trim();

        // 1. Empty or whitespace-only
        if sql.is_empty() {
            return ValidationOutcome::invalid("Empty SQL query");
        }

        // 2. First significant token must be a read-only verb
        if !self.read_verb.is_match(sql) {
            let first_token = sql
                .split_whitespace()
                .next()
                .unwrap_or("")
                .trim_end_matches(';')
                .to_uppercase();
            return ValidationOutcome::invalid(format!(
                "Only SELECT statements are allowed, found '{}'",
                first_token
            ));
        }

        // Multiple statements cannot sneak a write after the SELECT
        let stripped = strip_string_literals(sql);
        if stripped.trim_end_matches(';').contains(';') {
            return ValidationOutcome::invalid("Only a single SQL statement is allowed");
        }

        // 3. Forbidden keywords as standalone tokens, string literals excluded
        if let Some(m) = self.forbidden.find(&stripped) {
            return ValidationOutcome::invalid(format!(
                "Forbidden keyword '{}' found in query",
                m.as_str().to_uppercase()
            ));
        }

        // 4. Identifiers after FROM/JOIN must include a known table, unless
        //    the statement is a constant-expression SELECT
        let cte_names: Vec<String> = self
            .cte_name
            .captures_iter(&stripped)
            .map(|c| c[1].to_lowercase())
            .collect();

        let mut tables_used = Vec::new();
        let mut unknown = Vec::new();
        for caps in self.from_join_ident.captures_iter(&stripped) {
            let ident = caps[1].to_lowercase();
            if self.metadata.has_table(&ident) {
                tables_used.push(ident);
            } else if !cte_names.contains(&ident) {
                unknown.push(ident);
            }
        }
        let tables_used = unique_ordered(tables_used);

        let mut warnings = Vec::new();
        if tables_used.is_empty() {
            if let Some(first_unknown) = unknown.first() {
                return ValidationOutcome::invalid(format!(
                    "Unknown table referenced: {}",
                    first_unknown
                ));
            }
            warnings.push("No known tables referenced".to_string());
        } else if let Some(first_unknown) = unknown.first() {
            return ValidationOutcome::invalid(format!(
                "Unknown table referenced: {}",
                first_unknown
            ));
        }

        // 5. Smoke execution with LIMIT 1
        if let Err(error) = self.smoke_execute(sql).await {
            return ValidationOutcome::invalid(error);
        }

        ValidationOutcome { is_valid: true, error: None, tables_used, warnings }
    }
}

/// Blank out the contents of string literals so keyword and identifier scans
/// cannot be fooled by quoted text. Handles the doubled-quote escape.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            let quote = c;
            out.push(quote);
            while let Some(inner) = chars.next() {
                if inner == quote {
                    if chars.peek() == Some(&quote) {
                        chars.next();
                        out.push(' ');
                        continue;
                    }
                    out.push(quote);
                    break;
                }
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::SchemaMetadata;

    async fn banking_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");

        sqlx::query(
            r#"
            CREATE TABLE branches (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                city TEXT NOT NULL,
                state TEXT NOT NULL,
                manager_id INTEGER
            );
            "#,
        )
        .execute(&pool)
        .await
        .expect("Failed to create branches");

        sqlx::query(
            r#"
            CREATE TABLE customers (
                id INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                city TEXT,
                branch_id INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .expect("Failed to create customers");

        pool
    }

    fn store() -> Arc<MetadataStore> {
        let metadata: SchemaMetadata =
            serde_json::from_str(include_str!("../../../data/metadata.json")).unwrap();
        Arc::new(MetadataStore::from_metadata(metadata).unwrap())
    }

    async fn validator() -> SqlValidator {
        SqlValidator::new(store(), banking_pool().await)
    }

    #[tokio::test]
    async fn empty_sql_rejected() {
        let v = validator().await;
        let outcome = v.validate("   ").await;
        assert!(!outcome.is_valid);
        assert_eq!(outcome.error.as_deref(), Some("Empty SQL query"));
    }

    #[tokio::test]
    async fn drop_statement_rejected_naming_the_verb() {
        let v = validator().await;
        let outcome = v.validate("DROP TABLE customers;").await;
        assert!(!outcome.is_valid);
        let error = outcome.error.unwrap();
        assert!(error.contains("SELECT"));
        assert!(error.contains("DROP"));
    }

    #[tokio::test]
    async fn forbidden_keyword_inside_select_rejected() {
        let v = validator().await;
        let outcome = v.validate("SELECT * FROM customers; DELETE FROM customers").await;
        assert!(!outcome.is_valid);
    }

    #[tokio::test]
    async fn every_forbidden_keyword_is_caught() {
        let v = validator().await;
        for keyword in FORBIDDEN_KEYWORDS {
            let sql = format!("SELECT {} FROM customers", keyword);
            let outcome = v.validate(&sql).await;
            assert!(!outcome.is_valid, "{} slipped through", keyword);
            assert!(
                outcome.error.as_deref().unwrap().contains(*keyword),
                "error should name {}",
                keyword
            );
        }
    }

    #[tokio::test]
    async fn keyword_inside_string_literal_is_fine() {
        let v = validator().await;
        let outcome = v
            .validate("SELECT * FROM customers WHERE first_name = 'DROP'")
            .await;
        assert!(outcome.is_valid, "{:?}", outcome.error);
        assert_eq!(outcome.tables_used, vec!["customers"]);
    }

    #[tokio::test]
    async fn constant_select_valid_with_warning() {
        let v = validator().await;
        let outcome = v.validate("SELECT 1").await;
        assert!(outcome.is_valid);
        assert!(outcome.tables_used.is_empty());
        assert_eq!(outcome.warnings, vec!["No known tables referenced"]);
    }

    #[tokio::test]
    async fn unknown_table_rejected() {
        let v = validator().await;
        let outcome = v.validate("SELECT * FROM starships").await;
        assert!(!outcome.is_valid);
        assert!(outcome.error.as_deref().unwrap().contains("starships"));
    }

    #[tokio::test]
    async fn missing_column_caught_by_smoke_execution() {
        let v = validator().await;
        let outcome = v.validate("SELECT full_name FROM customers").await;
        assert!(!outcome.is_valid);
        let error = outcome.error.unwrap();
        assert!(error.contains("full_name"), "unexpected error: {}", error);
        assert_eq!(ErrorContext::classify(&error).error_type, SqlErrorKind::ColumnNotFound);
    }

    #[tokio::test]
    async fn with_cte_accepted() {
        let v = validator().await;
        let outcome = v
            .validate(
                "WITH big AS (SELECT * FROM customers) SELECT first_name FROM big LIMIT 5",
            )
            .await;
        assert!(outcome.is_valid, "{:?}", outcome.error);
        assert_eq!(outcome.tables_used, vec!["customers"]);
    }

    #[tokio::test]
    async fn smoke_execution_does_not_mutate() {
        let v = validator().await;
        sqlx::query("INSERT INTO customers (id, first_name, last_name, branch_id) VALUES (1, 'A', 'B', 1)")
            .execute(&v.pool)
            .await
            .unwrap();
        let outcome = v.validate("SELECT first_name FROM customers").await;
        assert!(outcome.is_valid);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
            .fetch_one(&v.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn classify_covers_the_taxonomy() {
        assert_eq!(
            ErrorContext::classify("no such table: loans").error_type,
            SqlErrorKind::TableNotFound
        );
        assert_eq!(
            ErrorContext::classify("no such column: full_name").error_type,
            SqlErrorKind::ColumnNotFound
        );
        assert_eq!(
            ErrorContext::classify("ambiguous column name: id").error_type,
            SqlErrorKind::AmbiguousColumn
        );
        assert_eq!(
            ErrorContext::classify("near \"FORM\": syntax error").error_type,
            SqlErrorKind::Syntax
        );
        assert_eq!(ErrorContext::classify("something odd").error_type, SqlErrorKind::Unknown);
    }

    #[test]
    fn string_literal_stripping_preserves_structure() {
        let stripped = strip_string_literals("SELECT 'DROP TABLE x; it''s fine' FROM t");
        assert!(!stripped.contains("DROP"));
        assert!(stripped.contains("FROM t"));
    }
}
