//! Planner - question analysis
//!
//! Derives from the raw question which tables are likely involved, which SQL
//! capabilities the answer needs, which phrases are ambiguous enough to ask
//! about, and a handful of follow-up suggestions. Pure over the metadata
//! store: no I/O, no randomness, deterministic for equal inputs.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::models::Clarification;
use crate::services::metadata::{MetadataStore, TableMeta};
use crate::utils::unique_ordered;

/// Planner output consumed by the retriever, generator and orchestrator.
#[derive(Debug, Clone)]
pub struct Plan {
    pub question: String,
    /// Likely relevant tables, ordered by first detection, unique.
    pub tables: Vec<String>,
    /// Sorted capability tags steering prompt construction.
    pub capabilities: Vec<String>,
    pub clarifications: Vec<Clarification>,
    pub follow_ups: Vec<String>,
    /// Metadata for the detected tables only.
    pub metadata_subset: BTreeMap<String, TableMeta>,
}

/// Question analysis capability.
pub trait Planner: Send + Sync {
    /// Never fails: empty or garbage input degrades to an all-tables plan
    /// with no capabilities and no clarifications.
    fn analyze(&self, question: &str) -> Plan;
}

// ============================================================================
// Keyword Planner
// ============================================================================

const AGG_TOKENS: &[&str] = &["average", "avg", "sum", "count", "total"];
const AGG_PHRASES: &[&str] = &["number of", "how many"];
const EXISTS_TOKENS: &[&str] = &["both", "either"];
const WINDOW_TOKENS: &[&str] = &["consecutive", "lag", "lead"];
const WEEKEND_TOKENS: &[&str] = &["weekend", "saturday", "sunday"];
const DATE_TOKENS: &[&str] =
    &["q1", "q2", "q3", "q4", "quarter", "year", "month", "week", "today", "yesterday", "last"];
const THRESHOLD_TOKENS: &[&str] = &["above", "below", "minimum", "max"];
const THRESHOLD_PHRASES: &[&str] = &["greater than", "less than", "at least", "more than"];
const MAGNITUDE_PHRASES: &[&str] = &["high value", "high balance", "rich", "wealthy"];

/// Singular stems mapped onto schema tables by substring, used only when no
/// direct or enum-value match fired.
const ENTITY_STEMS: &[&str] = &["customer", "account", "transaction", "employee", "branch"];

pub struct KeywordPlanner {
    metadata: Arc<MetadataStore>,
    numeric_token: Regex,
    year_token: Regex,
}

impl KeywordPlanner {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self {
            metadata,
            numeric_token: Regex::new(r"\b\d{2,}\b").expect("invalid numeric regex"),
            year_token: Regex::new(r"\b20\d{2}\b").expect("invalid year regex"),
        }
    }

    fn detect_tables(&self, lower: &str, words: &HashSet<String>) -> Vec<String> {
        let mut found = Vec::new();

        // Direct table name mentions
        for table in self.metadata.tables().keys() {
            if lower.contains(table.as_str()) {
                tracing::debug!("Found direct table mention: {}", table);
                found.push(table.clone());
            }
        }

        // Enumerated column values that pin down a table
        for (table_name, table) in self.metadata.tables() {
            'columns: for column in table.columns.values() {
                for value in &column.distinct_values {
                    if contains_term(lower, words, &value.to_lowercase()) {
                        tracing::debug!(
                            "Found table {} via column value match: {}",
                            table_name,
                            value
                        );
                        found.push(table_name.clone());
                        break 'columns;
                    }
                }
            }
        }

        // Singular/plural heuristics, only when nothing matched yet
        if found.is_empty() {
            for stem in ENTITY_STEMS {
                if lower.contains(stem) {
                    for table in self.metadata.tables().keys() {
                        if table.contains(stem) {
                            tracing::debug!("Found table {} via stem heuristic: {}", table, stem);
                            found.push(table.clone());
                        }
                    }
                }
            }
        }

        let unique = unique_ordered(found);
        if unique.is_empty() {
            tracing::debug!("No tables detected, falling back to all tables");
            return self.metadata.table_names();
        }
        unique
    }

    fn detect_capabilities(&self, lower: &str, words: &HashSet<String>) -> Vec<String> {
        let mut caps = BTreeSet::new();

        if AGG_TOKENS.iter().any(|t| words.contains(*t))
            || AGG_PHRASES.iter().any(|p| lower.contains(p))
        {
            caps.insert("aggregate");
        }
        if EXISTS_TOKENS.iter().any(|t| words.contains(*t)) || lower.contains("have both") {
            caps.insert("exists");
        }
        if WINDOW_TOKENS.iter().any(|t| words.contains(*t)) {
            caps.insert("window");
        }
        if WEEKEND_TOKENS.iter().any(|t| words.contains(*t)) {
            caps.insert("weekend");
        }
        if DATE_TOKENS.iter().any(|t| words.contains(*t))
            || lower.contains("first quarter")
            || self.year_token.is_match(lower)
        {
            caps.insert("date_filter");
        }
        if THRESHOLD_TOKENS.iter().any(|t| words.contains(*t))
            || THRESHOLD_PHRASES.iter().any(|p| lower.contains(p))
        {
            caps.insert("threshold");
        }

        // Metadata-driven tags: a mentioned enum value of these well-known
        // columns implies the matching filter.
        if self.mentions_domain_value(lower, words, "accounts", "type") {
            caps.insert("account_type_filter");
        }
        if self.mentions_domain_value(lower, words, "transactions", "type") {
            caps.insert("transaction_type_filter");
        }
        if self.mentions_domain_value(lower, words, "employees", "position") {
            caps.insert("position_filter");
        }

        if lower.contains("manager") || lower.contains("handled") {
            caps.insert("join_employees");
        }

        caps.into_iter().map(String::from).collect()
    }

    fn mentions_domain_value(
        &self,
        lower: &str,
        words: &HashSet<String>,
        table: &str,
        column: &str,
    ) -> bool {
        self.metadata
            .distinct_values(table, column)
            .iter()
            .any(|v| contains_term(lower, words, &v.to_lowercase()))
    }

    fn detect_clarifications(&self, question: &str, lower: &str) -> Vec<Clarification> {
        let mut clarifications = Vec::new();

        // Vague magnitude words without a concrete number
        if MAGNITUDE_PHRASES.iter().any(|p| lower.contains(p))
            && !self.numeric_token.is_match(question)
        {
            let default_threshold = self
                .metadata
                .sample_high("accounts", "balance")
                .unwrap_or(20000.0);
            clarifications.push(Clarification {
                field: "min_balance".to_string(),
                prompt: "What minimum balance should count as 'high'?".to_string(),
                kind: "number".to_string(),
                default: serde_json::json!(default_threshold),
                options: None,
            });
        }

        let has_year = self.year_token.is_match(question);

        // Ambiguous timeframe
        if (lower.contains("recent") || lower.contains("last")) && !has_year {
            clarifications.push(Clarification {
                field: "date_range".to_string(),
                prompt: "What date range do you mean by 'recent'?".to_string(),
                kind: "text".to_string(),
                default: serde_json::json!("last 30 days"),
                options: None,
            });
        }

        // Q1 without a year
        if (lower.contains("q1") || lower.contains("first quarter")) && !has_year {
            clarifications.push(Clarification {
                field: "date_range".to_string(),
                prompt: "Confirm date range for Q1".to_string(),
                kind: "text".to_string(),
                default: serde_json::json!("2025-01-01..2025-03-31"),
                options: None,
            });
        }

        // "account" without a concrete account type
        let account_types = self.metadata.distinct_values("accounts", "type");
        if lower.contains("account")
            && !account_types.is_empty()
            && !account_types.iter().any(|t| lower.contains(&t.to_lowercase()))
        {
            clarifications.push(Clarification {
                field: "account_type".to_string(),
                prompt: "What type of account are you interested in?".to_string(),
                kind: "select".to_string(),
                default: serde_json::json!(account_types[0]),
                options: Some(account_types.to_vec()),
            });
        }

        clarifications
    }

    fn follow_up_suggestions(&self, lower: &str) -> Vec<String> {
        let mut suggestions = Vec::new();

        if lower.contains("branch") {
            if lower.contains("transaction") {
                suggestions.extend([
                    "Show me the bottom 5 performing branches".to_string(),
                    "What's the average transaction amount by branch?".to_string(),
                    "Show me branch performance by month".to_string(),
                    "Compare branch performance by employee count".to_string(),
                ]);
            } else {
                suggestions.extend([
                    "Show me the top 10 branches by transaction volume".to_string(),
                    "Which branches have the most employees?".to_string(),
                    "Show me branch performance by revenue".to_string(),
                    "What's the average account balance by branch?".to_string(),
                ]);
            }
        }

        if lower.contains("account") || lower.contains("balance") {
            let account_types = self.metadata.distinct_values("accounts", "type");
            if account_types.len() >= 2 {
                suggestions.push(format!(
                    "Show me customers with both {} and {} accounts",
                    account_types[0], account_types[1]
                ));
            }
            suggestions.extend([
                "Show me the top 10 accounts by balance".to_string(),
                "What's the average account balance?".to_string(),
                "Show me account distribution by type".to_string(),
            ]);
        }

        if lower.contains("employee") || lower.contains("salary") {
            let positions = self.metadata.distinct_values("employees", "position");
            if let Some(position) = positions.first() {
                suggestions.push(format!("Show me all {}s", position));
            }
            suggestions.extend([
                "Show me the top 10 highest paid employees".to_string(),
                "What's the average employee salary?".to_string(),
                "Show me salary distribution by position".to_string(),
            ]);
        }

        if lower.contains("transaction") {
            let tx_types = self.metadata.distinct_values("transactions", "type");
            if let Some(tx_type) = tx_types.first() {
                suggestions.push(format!("Show me all {} transactions", tx_type));
            }
            suggestions.extend([
                "Show me transaction trends by month".to_string(),
                "What's the average transaction amount?".to_string(),
                "Show me transactions by type".to_string(),
            ]);
        }

        if suggestions.is_empty() {
            suggestions.extend([
                "Show me the count of rows by each table".to_string(),
                "What's the top performing branch?".to_string(),
                "Show me the highest balance account".to_string(),
                "Which employee has the highest salary?".to_string(),
            ]);
        }

        suggestions.truncate(4);
        suggestions
    }

    fn metadata_subset(&self, tables: &[String]) -> BTreeMap<String, TableMeta> {
        tables
            .iter()
            .filter_map(|t| self.metadata.table(t).map(|meta| (t.clone(), meta.clone())))
            .collect()
    }
}

impl Planner for KeywordPlanner {
    fn analyze(&self, question: &str) -> Plan {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            let tables = self.metadata.table_names();
            let metadata_subset = self.metadata_subset(&tables);
            return Plan {
                question: question.to_string(),
                tables,
                capabilities: Vec::new(),
                clarifications: Vec::new(),
                follow_ups: Vec::new(),
                metadata_subset,
            };
        }

        let lower = trimmed.to_lowercase();
        let words = tokenize(&lower);

        let mut tables = self.detect_tables(&lower, &words);
        let capabilities = self.detect_capabilities(&lower, &words);

        // A join hint pulls the employees table in even when the question
        // never names it (e.g. "branches and their managers").
        if capabilities.iter().any(|c| c == "join_employees")
            && self.metadata.has_table("employees")
            && !tables.iter().any(|t| t == "employees")
        {
            tables.push("employees".to_string());
        }

        let clarifications = self.detect_clarifications(trimmed, &lower);
        let follow_ups = self.follow_up_suggestions(&lower);
        let metadata_subset = self.metadata_subset(&tables);

        tracing::debug!(
            "Plan: tables={:?}, capabilities={:?}, clarifications={}",
            tables,
            capabilities,
            clarifications.len()
        );

        Plan {
            question: question.to_string(),
            tables,
            capabilities,
            clarifications,
            follow_ups,
            metadata_subset,
        }
    }
}

/// Lowercased word set of the question.
fn tokenize(lower: &str) -> HashSet<String> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

/// Multi-word terms match as substrings, single words as whole tokens.
fn contains_term(lower: &str, words: &HashSet<String>, term: &str) -> bool {
    if term.contains(' ') { lower.contains(term) } else { words.contains(term) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::MetadataStore;

    fn planner() -> KeywordPlanner {
        let metadata: crate::services::metadata::SchemaMetadata =
            serde_json::from_str(include_str!("../../../data/metadata.json"))
                .expect("Failed to parse fixture metadata");
        KeywordPlanner::new(Arc::new(MetadataStore::from_metadata(metadata).unwrap()))
    }

    #[test]
    fn empty_question_degrades_to_all_tables() {
        let plan = planner().analyze("   ");
        assert_eq!(
            plan.tables,
            vec!["accounts", "branches", "customers", "employees", "transactions"]
        );
        assert!(plan.capabilities.is_empty());
        assert!(plan.clarifications.is_empty());
    }

    #[test]
    fn unknown_topic_falls_back_to_all_tables() {
        let plan = planner().analyze("What is the meaning of life?");
        assert_eq!(plan.tables.len(), 5);
    }

    #[test]
    fn branch_manager_question_pulls_employees() {
        let plan = planner().analyze("List all branches and their managers.");
        assert!(plan.tables.contains(&"branches".to_string()));
        assert!(plan.tables.contains(&"employees".to_string()));
        assert!(plan.capabilities.contains(&"join_employees".to_string()));
    }

    #[test]
    fn both_account_types_question() {
        let plan = planner().analyze("Find customers who have both checking and savings accounts.");
        assert!(plan.tables.contains(&"customers".to_string()));
        assert!(plan.tables.contains(&"accounts".to_string()));
        assert!(plan.capabilities.contains(&"exists".to_string()));
        assert!(plan.capabilities.contains(&"account_type_filter".to_string()));
        // Concrete types present, so no account-type clarification
        assert!(plan.clarifications.iter().all(|c| c.field != "account_type"));
    }

    #[test]
    fn wealthy_question_asks_for_threshold() {
        let plan = planner().analyze("Show me our wealthy customers.");
        let clar = plan
            .clarifications
            .iter()
            .find(|c| c.field == "min_balance")
            .expect("min_balance clarification expected");
        assert_eq!(clar.kind, "number");
        assert_eq!(clar.default, serde_json::json!(20000.0));
    }

    #[test]
    fn wealthy_with_number_needs_no_clarification() {
        let plan = planner().analyze("Show me wealthy customers with balance over 50000.");
        assert!(plan.clarifications.iter().all(|c| c.field != "min_balance"));
    }

    #[test]
    fn recent_without_year_asks_for_range() {
        let plan = planner().analyze("Show recent transactions");
        let clar = plan
            .clarifications
            .iter()
            .find(|c| c.field == "date_range")
            .expect("date_range clarification expected");
        assert_eq!(clar.default, serde_json::json!("last 30 days"));
    }

    #[test]
    fn recent_with_year_is_unambiguous() {
        let plan = planner().analyze("Show recent transactions from 2025");
        assert!(plan.clarifications.iter().all(|c| c.field != "date_range"));
        assert!(plan.capabilities.contains(&"date_filter".to_string()));
    }

    #[test]
    fn vague_account_mention_asks_for_type() {
        let plan = planner().analyze("Show me account totals");
        let clar = plan
            .clarifications
            .iter()
            .find(|c| c.field == "account_type")
            .expect("account_type clarification expected");
        assert_eq!(clar.kind, "select");
        assert_eq!(
            clar.options.as_deref(),
            Some(&["checking".to_string(), "savings".to_string(), "credit".to_string()][..])
        );
    }

    #[test]
    fn position_value_detected_from_metadata() {
        let plan = planner().analyze("Which branch manager approved this?");
        assert!(plan.capabilities.contains(&"position_filter".to_string()));
    }

    #[test]
    fn follow_ups_capped_at_four() {
        let p = planner();
        for question in
            ["branches and transactions", "account balance", "employee salary", "nothing here"]
        {
            assert!(p.analyze(question).follow_ups.len() <= 4);
        }
        assert_eq!(p.analyze("Show branch totals").follow_ups.len(), 4);
    }

    #[test]
    fn analyze_is_deterministic() {
        let p = planner();
        let question = "Find customers who have both checking and savings accounts.";
        let a = p.analyze(question);
        let b = p.analyze(question);
        assert_eq!(a.tables, b.tables);
        assert_eq!(a.capabilities, b.capabilities);
        assert_eq!(a.clarifications, b.clarifications);
        assert_eq!(a.follow_ups, b.follow_ups);
    }

    #[test]
    fn metadata_subset_matches_detected_tables() {
        let plan = planner().analyze("List all branches and their managers.");
        for table in &plan.tables {
            assert!(plan.metadata_subset.contains_key(table));
        }
        assert_eq!(plan.metadata_subset.len(), plan.tables.len());
    }
}
