//! Summarizer - deterministic, schema-aware result rollup
//!
//! Turns an execution outcome into a human-readable summary and a small list
//! of follow-up questions. No LLM call: the text is templated per question
//! domain and every aggregate is computed over the returned row set only.

use std::sync::Arc;

use super::executor::ExecutionOutcome;
use crate::models::Row;
use crate::services::metadata::MetadataStore;

/// Summarizer output.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub suggestions: Vec<String>,
}

/// Rollup capability.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, question: &str, result: &ExecutionOutcome) -> Summary;
}

pub struct ResultSummarizer {
    metadata: Arc<MetadataStore>,
}

impl ResultSummarizer {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    fn branch_summary(&self, question: &str, rows: &[Row]) -> Summary {
        let total = rows.len();
        let mut parts = vec![
            format!("**Branch Analysis**\n\n**Your Question:** {}\n", question),
            format!("Found **{}** {}.", total, pluralize(total, "branch", "branches")),
        ];

        if rows.iter().any(|r| r.contains_key("manager_name")) {
            let managed = rows
                .iter()
                .filter(|r| r.get("manager_name").is_some_and(|v| !v.is_null()))
                .count();
            let unmanaged = total - managed;
            parts.push("\n**Management Overview:**".to_string());
            parts.push(format!("- Branches with managers: **{}**", managed));
            parts.push(format!("- Branches without managers: **{}**", unmanaged));
            if total > 0 {
                parts.push(format!(
                    "- Management coverage: **{:.1}%**",
                    managed as f64 / total as f64 * 100.0
                ));
            }
        }

        if rows.iter().any(|r| r.contains_key("state")) {
            let states = self.metadata.distinct_values("branches", "state");
            let lines = enum_distribution(rows, "state", states);
            if !lines.is_empty() {
                parts.push("\n**State Distribution:**".to_string());
                parts.extend(lines);
            }
        }

        Summary {
            text: parts.join("\n"),
            suggestions: vec![
                "Show me branches without managers".to_string(),
                "Which branch has the most employees?".to_string(),
                "Show me branch performance by transaction volume".to_string(),
                "List branches by city".to_string(),
            ],
        }
    }

    fn employee_summary(&self, question: &str, rows: &[Row]) -> Summary {
        let total = rows.len();
        let mut parts = vec![
            format!("**Employee Analysis**\n\n**Your Question:** {}\n", question),
            format!("Found **{}** {}.", total, pluralize(total, "employee", "employees")),
        ];

        if let Some(stats) = NumericStats::over(rows, "salary") {
            parts.push("\n**Salary Statistics:**".to_string());
            parts.push(format!("- Average: **${:.2}**", stats.avg));
            parts.push(format!("- Highest: **${:.2}**", stats.max));
            parts.push(format!("- Lowest: **${:.2}**", stats.min));
        }

        let positions = self.metadata.distinct_values("employees", "position");
        let lines = enum_distribution(rows, "position", positions);
        if !lines.is_empty() {
            parts.push("\n**Position Distribution:**".to_string());
            parts.extend(lines);
        }

        Summary {
            text: parts.join("\n"),
            suggestions: vec![
                "Show me the highest paid employees".to_string(),
                "What's the average salary by position?".to_string(),
                "Show me employees hired in the last year".to_string(),
                "Which employees handle the most transactions?".to_string(),
            ],
        }
    }

    fn account_summary(&self, question: &str, rows: &[Row]) -> Summary {
        let total = rows.len();
        let mut parts = vec![
            format!("**Account Analysis**\n\n**Your Question:** {}\n", question),
            format!("Found **{}** {}.", total, pluralize(total, "account", "accounts")),
        ];

        if let Some(stats) = NumericStats::over(rows, "balance") {
            parts.push("\n**Balance Statistics:**".to_string());
            parts.push(format!("- Total Balance: **${:.2}**", stats.sum));
            parts.push(format!("- Average Balance: **${:.2}**", stats.avg));
        }

        let types = self.metadata.distinct_values("accounts", "type");
        let lines = enum_distribution(rows, "type", types);
        if !lines.is_empty() {
            parts.push("\n**Account Types:**".to_string());
            parts.extend(lines);
        }

        let statuses = self.metadata.distinct_values("accounts", "status");
        let lines = enum_distribution(rows, "status", statuses);
        if !lines.is_empty() {
            parts.push("\n**Account Status:**".to_string());
            parts.extend(lines);
        }

        Summary {
            text: parts.join("\n"),
            suggestions: vec![
                "Show me accounts with high balances".to_string(),
                "What's the average balance by account type?".to_string(),
                "Show me recently opened accounts".to_string(),
                "Which accounts have the most transactions?".to_string(),
            ],
        }
    }

    fn transaction_summary(&self, question: &str, rows: &[Row]) -> Summary {
        let total = rows.len();
        let mut parts = vec![
            format!("**Transaction Analysis**\n\n**Your Question:** {}\n", question),
            format!("Found **{}** {}.", total, pluralize(total, "transaction", "transactions")),
        ];

        if let Some(stats) = NumericStats::over(rows, "amount") {
            parts.push("\n**Amount Statistics:**".to_string());
            parts.push(format!("- Total Amount: **${:.2}**", stats.sum));
            parts.push(format!("- Average Amount: **${:.2}**", stats.avg));
        }

        let types = self.metadata.distinct_values("transactions", "type");
        let lines = enum_distribution(rows, "type", types);
        if !lines.is_empty() {
            parts.push("\n**Transaction Types:**".to_string());
            parts.extend(lines);
        }

        let statuses = self.metadata.distinct_values("transactions", "status");
        let lines = enum_distribution(rows, "status", statuses);
        if !lines.is_empty() {
            parts.push("\n**Transaction Status:**".to_string());
            parts.extend(lines);
        }

        Summary {
            text: parts.join("\n"),
            suggestions: vec![
                "Show me high-value transactions".to_string(),
                "What's the average transaction amount by type?".to_string(),
                "Show me today's transactions".to_string(),
                "Which accounts have the most transactions?".to_string(),
            ],
        }
    }

    fn generic_summary(&self, question: &str, rows: &[Row]) -> Summary {
        let total = rows.len();
        let mut parts = vec![
            format!("**Query Results**\n\n**Your Question:** {}\n", question),
            format!("Found **{}** {}.", total, pluralize(total, "result", "results")),
        ];

        // Column roles inferred from the first row
        let first = &rows[0];
        let numeric_columns: Vec<&String> =
            first.iter().filter(|(_, v)| v.is_number()).map(|(k, _)| k).collect();
        let text_columns: Vec<&String> =
            first.iter().filter(|(_, v)| v.is_string()).map(|(k, _)| k).collect();

        if !numeric_columns.is_empty() {
            parts.push("\n**Numeric Column Statistics:**".to_string());
            for column in numeric_columns.iter().take(3) {
                if let Some(stats) = NumericStats::over(rows, column) {
                    parts.push(format!("- {}:", column));
                    parts.push(format!("  - Average: **{:.2}**", stats.avg));
                    parts.push(format!("  - Range: **{:.2}** to **{:.2}**", stats.min, stats.max));
                }
            }
        }

        for column in text_columns.iter().take(2) {
            let counts = value_counts(rows, column);
            if counts.is_empty() {
                continue;
            }
            parts.push(format!("\n**{} Distribution:**", column));
            for (value, count) in counts.into_iter().take(3) {
                parts.push(format!("- {}: **{}**", value, count));
            }
        }

        Summary {
            text: parts.join("\n"),
            suggestions: vec![
                "Show me the count of rows by table".to_string(),
                "What are the most common values?".to_string(),
                "Show me the data distribution".to_string(),
                "Can you explain the patterns in this data?".to_string(),
            ],
        }
    }
}

impl Summarizer for ResultSummarizer {
    fn summarize(&self, question: &str, result: &ExecutionOutcome) -> Summary {
        if !result.success {
            return Summary {
                text: format!(
                    "**Query Failed**\n\n**Your Question:** {}\n\n**Error:** {}",
                    question,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                suggestions: vec![
                    "Try rephrasing your question".to_string(),
                    "Check if the table names are correct".to_string(),
                    "Make sure you're asking about existing data".to_string(),
                ],
            };
        }

        if result.rows.is_empty() {
            return Summary {
                text: format!(
                    "**No Results Found**\n\n**Your Question:** {}\n\nNo data matches your criteria. Try refining your search or ask a different question.",
                    question
                ),
                suggestions: vec![
                    "Try broadening your search criteria".to_string(),
                    "Check if the data exists in the database".to_string(),
                    "Try a different time period or category".to_string(),
                ],
            };
        }

        let lower = question.to_lowercase();
        if lower.contains("branch") {
            self.branch_summary(question, &result.rows)
        } else if lower.contains("employee") || lower.contains("salary") {
            self.employee_summary(question, &result.rows)
        } else if lower.contains("account") || lower.contains("balance") {
            self.account_summary(question, &result.rows)
        } else if lower.contains("transaction") {
            self.transaction_summary(question, &result.rows)
        } else {
            self.generic_summary(question, &result.rows)
        }
    }
}

// ============================================================================
// Row-set folds
// ============================================================================

fn pluralize<'a>(count: usize, singular: &'a str, plural: &'a str) -> &'a str {
    if count == 1 { singular } else { plural }
}

struct NumericStats {
    sum: f64,
    avg: f64,
    min: f64,
    max: f64,
}

impl NumericStats {
    fn over(rows: &[Row], column: &str) -> Option<Self> {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.get(column).and_then(|v| v.as_f64()))
            .collect();
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { sum, avg: sum / values.len() as f64, min, max })
    }
}

/// Counts per declared enum value, in domain order, omitting absent values.
fn enum_distribution(rows: &[Row], column: &str, domain: &[String]) -> Vec<String> {
    domain
        .iter()
        .filter_map(|value| {
            let count = rows
                .iter()
                .filter(|r| r.get(column).and_then(|v| v.as_str()) == Some(value))
                .count();
            (count > 0).then(|| format!("- {}: **{}**", value, count))
        })
        .collect()
}

/// Value counts for a free-text column, most frequent first; ties break by
/// first appearance to stay deterministic.
fn value_counts(rows: &[Row], column: &str) -> Vec<(String, usize)> {
    let mut order = Vec::new();
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for row in rows {
        if let Some(value) = row.get(column).and_then(|v| v.as_str()) {
            if !counts.contains_key(value) {
                order.push(value.to_string());
            }
            *counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }
    let mut result: Vec<(String, usize)> = order
        .into_iter()
        .map(|v| {
            let count = counts[&v];
            (v, count)
        })
        .collect();
    result.sort_by(|a, b| b.1.cmp(&a.1));
    result
}
