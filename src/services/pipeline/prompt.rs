//! Prompt Builder - schema-infused, few-shot, chain-of-thought prompting
//!
//! Renders the structured prompt document the generator sends to the LLM:
//! hard instructions, a compact schema context with relationships and value
//! domains, reasoning steps computed from the plan, up to two worked
//! examples, the machine-readable output format, and (for repair attempts)
//! the previous SQL with its error. The rendered document is a single JSON
//! object with sorted keys, so equal inputs always produce identical text.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use super::planner::Plan;
use super::validator::ErrorContext;
use crate::services::metadata::MetadataStore;

// ============================================================================
// Worked Examples
// ============================================================================

/// A curated (question, SQL) pair with worked reasoning, selected into the
/// prompt when its tables and keywords overlap the live question.
#[derive(Debug, Clone)]
pub struct QueryExample {
    pub nl_query: &'static str,
    pub sql_query: &'static str,
    pub suggestion: &'static str,
    pub reasoning_steps: &'static [&'static str],
    pub tables_used: &'static [&'static str],
    pub key_columns: &'static [&'static str],
    pub conditions: &'static [&'static str],
}

/// The built-in exemplar corpus. The retriever narrows this by table
/// overlap; the prompt builder narrows further by keyword overlap.
pub fn example_corpus() -> &'static [QueryExample] {
    &[
        QueryExample {
            nl_query: "List all branches and their managers' names. Include branches without a manager.",
            sql_query: "SELECT b.name AS branch_name, e.name AS manager_name \
                        FROM branches b \
                        LEFT JOIN employees e ON b.manager_id = e.id AND e.position = 'Branch Manager' \
                        ORDER BY b.name;",
            suggestion: "Retrieves all bank branches and their manager names, using a LEFT JOIN so branches without an assigned manager still appear. Results are ordered by branch name.",
            reasoning_steps: &[
                "1. Identify main entity: branches table",
                "2. Manager names require a join with employees",
                "3. Use LEFT JOIN to keep branches without managers",
                "4. Filter for the Branch Manager position",
                "5. Order by branch name for readability",
            ],
            tables_used: &["branches", "employees"],
            key_columns: &["branches.manager_id", "employees.id", "employees.position"],
            conditions: &["e.position = 'Branch Manager'"],
        },
        QueryExample {
            nl_query: "Find customers who have both checking and savings accounts.",
            sql_query: "SELECT DISTINCT c.first_name || ' ' || c.last_name AS customer_name, c.email, c.phone \
                        FROM customers c \
                        JOIN accounts a1 ON c.id = a1.customer_id AND a1.type = 'checking' AND a1.status = 'active' \
                        JOIN accounts a2 ON c.id = a2.customer_id AND a2.type = 'savings' AND a2.status = 'active' \
                        ORDER BY customer_name;",
            suggestion: "Finds customers holding both account types by joining accounts twice under different aliases, considering active accounts only and returning distinct customer names in order.",
            reasoning_steps: &[
                "1. Start with customers for personal info",
                "2. Join accounts twice (a1, a2) to require both types",
                "3. Filter for active accounts only",
                "4. Use DISTINCT to avoid duplicates",
                "5. Concatenate first and last names for readability",
            ],
            tables_used: &["customers", "accounts"],
            key_columns: &["customers.id", "accounts.customer_id", "accounts.type", "accounts.status"],
            conditions: &["a1.type = 'checking'", "a2.type = 'savings'", "status = 'active'"],
        },
        QueryExample {
            nl_query: "What is the average transaction amount by type?",
            sql_query: "SELECT t.type, COUNT(*) AS transaction_count, AVG(t.amount) AS average_amount \
                        FROM transactions t \
                        WHERE t.status = 'completed' \
                        GROUP BY t.type \
                        ORDER BY average_amount DESC;",
            suggestion: "Aggregates completed transactions per type, reporting how many there are and the average amount, largest first.",
            reasoning_steps: &[
                "1. Single entity: transactions table",
                "2. Aggregate with COUNT and AVG",
                "3. Group by the transaction type",
                "4. Only completed transactions count",
                "5. Order by the aggregate for quick reading",
            ],
            tables_used: &["transactions"],
            key_columns: &["transactions.type", "transactions.amount", "transactions.status"],
            conditions: &["t.status = 'completed'"],
        },
    ]
}

// ============================================================================
// History Ring
// ============================================================================

/// One prior query kept by the prompt builder. The ring is bounded by
/// `max_history`; the oldest entry falls off first.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub question: String,
    pub sql: String,
    pub suggestion: String,
    pub success: bool,
    pub error_context: Option<String>,
    pub reasoning_steps: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(question: &str, sql: &str, suggestion: &str, success: bool) -> Self {
        Self {
            question: question.to_string(),
            sql: sql.to_string(),
            suggestion: suggestion.to_string(),
            success,
            error_context: None,
            reasoning_steps: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_context = Some(error.into());
        self
    }
}

// ============================================================================
// Repair Context
// ============================================================================

/// Everything the repair prompt says about the failed attempt.
#[derive(Debug, Clone)]
pub struct RepairContext {
    pub previous_sql: String,
    pub error_message: String,
    pub error_type: String,
    pub suggestion: String,
    pub examples: Vec<String>,
    /// Declared value domains for enum columns the failing SQL compared
    /// against out-of-domain literals.
    pub value_domains: Vec<String>,
}

impl RepairContext {
    pub fn build(previous_sql: &str, error_message: &str, metadata: &MetadataStore) -> Self {
        let context = ErrorContext::classify(error_message);
        Self {
            previous_sql: previous_sql.to_string(),
            error_message: error_message.to_string(),
            error_type: context.error_type.as_str().to_string(),
            suggestion: context.suggestion,
            examples: context.examples,
            value_domains: enum_violations(previous_sql, metadata),
        }
    }
}

/// Scan a SQL text for `column = 'literal'` comparisons where the column has
/// a declared enumerated domain and the literal falls outside it. Returns one
/// note per offending column with the full legal domain.
pub fn enum_violations(sql: &str, metadata: &MetadataStore) -> Vec<String> {
    let comparison = regex::Regex::new(r"(?i)([A-Za-z_][A-Za-z0-9_]*)\s*=\s*'([^']*)'")
        .expect("invalid comparison regex");

    // Only check tables the statement names; an unqualified column like
    // `type` exists in several tables with different domains.
    let lower_sql = sql.to_lowercase();
    let mentioned: Vec<&String> = metadata
        .tables()
        .keys()
        .filter(|t| lower_sql.contains(t.as_str()))
        .collect();

    let mut notes = Vec::new();
    let mut seen = HashSet::new();
    for caps in comparison.captures_iter(sql) {
        let column = caps[1].to_lowercase();
        let literal = &caps[2];
        for (table_name, table) in metadata.tables() {
            if !mentioned.is_empty() && !mentioned.iter().any(|m| *m == table_name) {
                continue;
            }
            let Some(col) = table.columns.get(&column) else { continue };
            if col.distinct_values.is_empty() {
                continue;
            }
            let in_domain = col.distinct_values.iter().any(|v| v == literal);
            if !in_domain && seen.insert(format!("{}.{}", table_name, column)) {
                notes.push(format!(
                    "{}.{} valid values: {}",
                    table_name,
                    column,
                    col.distinct_values.join(", ")
                ));
            }
        }
    }
    notes
}

// ============================================================================
// Prompt Builder
// ============================================================================

pub struct PromptBuilder {
    metadata: Arc<MetadataStore>,
    history: VecDeque<HistoryEntry>,
    max_history: usize,
}

impl PromptBuilder {
    pub fn new(metadata: Arc<MetadataStore>, max_history: usize) -> Self {
        Self { metadata, history: VecDeque::new(), max_history }
    }

    /// Append a prior query to the bounded ring.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    /// Render the full prompt document. Stable for equal inputs: serde_json
    /// maps sort their keys and examples keep corpus order.
    pub fn build_prompt(
        &self,
        question: &str,
        plan: &Plan,
        exemplars: &[QueryExample],
        clarified_values: &BTreeMap<String, Value>,
        repair: Option<&RepairContext>,
    ) -> String {
        let reasoning_steps = self.chain_of_thought(question, plan);
        let examples = relevant_examples(question, &plan.tables, exemplars);

        let mut prompt = json!({
            "critical_requirements": {
                "schema_adherence": [
                    "ONLY use columns that exist in the provided schema metadata",
                    "Verify each column name against the schema before using",
                    "Check data types and constraints from schema",
                ],
                "aggregation_guidelines": [
                    "Add COUNT, SUM, AVG where relevant to provide insights",
                    "Include GROUP BY when using aggregations",
                    "Consider HAVING clauses for aggregate filters",
                ],
                "join_validation": [
                    "Verify all required joins based on foreign key relationships",
                    "Use appropriate JOIN types (LEFT, INNER) based on requirements",
                    "Include all necessary join conditions",
                ],
                "where_conditions": [
                    "Add status='active' checks where applicable",
                    "Include date range filters when temporal context exists",
                    "Validate values against domain constraints",
                ],
            },
            "analysis_steps": [
                "1. Identify entities and columns from schema metadata",
                "2. Map identified elements to relevant tables/columns",
                "3. Plan necessary joins using foreign key relationships",
                "4. Determine required aggregations and grouping",
                "5. Add appropriate WHERE conditions and filters",
                "6. Structure the final SQL query",
                "7. Validate against schema constraints",
                "8. Provide reasoning for choices made",
            ],
            "task": {
                "objective": "Generate a SQLite SQL query",
                "input_query": question,
                "context": "Relational database question answering",
                "output_format": {
                    "type": "json",
                    "structure": {
                        "SQLQuery": "The executable SQL query that fulfills the request",
                        "Suggestion": "A natural language description of what the SQL query does",
                        "Reasoning": {
                            "identified_entities": ["List of tables and columns identified"],
                            "join_logic": ["Explanation of join relationships used"],
                            "aggregation_choices": ["Why certain aggregations were added"],
                            "filter_conditions": ["Reasoning for WHERE conditions"],
                        },
                    },
                },
            },
            "schema_context": self.schema_context(plan),
            "reasoning": {
                "chain_of_thought": {
                    "steps": reasoning_steps,
                    "explanation": "Following systematic analysis process",
                },
                "detected_capabilities": plan.capabilities,
                "required_tables": plan.tables,
            },
            "examples": examples
                .iter()
                .map(|ex| {
                    json!({
                        "natural_language": ex.nl_query,
                        "output": {
                            "SQLQuery": ex.sql_query,
                            "Suggestion": ex.suggestion,
                            "Reasoning": {
                                "identified_entities": ex.tables_used,
                                "join_logic": ex.key_columns,
                                "filter_conditions": ex.conditions,
                            },
                        },
                    })
                })
                .collect::<Vec<_>>(),
            "requirements": {
                "output_format": [
                    "Return a JSON object with SQLQuery, Suggestion, and Reasoning",
                    "SQLQuery must contain only the executable SQL query",
                    "Suggestion must provide a clear description of the query's purpose",
                    "Reasoning must explain all key decisions made",
                ],
                "schema_validation": [
                    "Verify every column exists in schema",
                    "Check data types match schema",
                    "Validate against domain constraints",
                ],
                "join_requirements": [
                    "Use proper table aliases",
                    "Include all necessary join conditions",
                    "Follow foreign key relationships",
                ],
                "aggregation_rules": [
                    "Add appropriate GROUP BY clauses",
                    "Consider HAVING for aggregate filters",
                    "Use DISTINCT when needed",
                ],
                "filter_guidelines": [
                    "Add status checks where relevant",
                    "Include date filters when needed",
                    "Validate literal values",
                ],
            },
        });

        let doc = prompt.as_object_mut().expect("prompt root is an object");

        if !clarified_values.is_empty() {
            doc.insert(
                "clarified_values".to_string(),
                json!({
                    "note": "The user resolved earlier ambiguities with these values; honor them in the SQL",
                    "values": clarified_values,
                }),
            );
        }

        if !self.history.is_empty() {
            let recent: Vec<Value> = self
                .history
                .iter()
                .map(|h| {
                    json!({
                        "question": h.question,
                        "sql": h.sql,
                        "was_successful": h.success,
                    })
                })
                .collect();
            doc.insert("recent_history".to_string(), json!(recent));
        }

        if let Some(repair) = repair {
            let mut error_context = json!({
                "previous_error": {
                    "failed_sql": repair.previous_sql,
                    "error_message": repair.error_message,
                    "error_type": repair.error_type,
                    "suggestion": repair.suggestion,
                    "examples": repair.examples,
                },
                "correction_focus": [
                    "Verify column names against schema",
                    "Check join conditions",
                    "Validate value domains",
                    "Review aggregation logic",
                ],
            });
            if !repair.value_domains.is_empty() {
                error_context
                    .as_object_mut()
                    .expect("error context is an object")
                    .insert("value_domains".to_string(), json!(repair.value_domains));
            }
            doc.insert("error_context".to_string(), error_context);
        }

        serde_json::to_string_pretty(&prompt).expect("prompt serialization cannot fail")
    }

    /// Schema context restricted to the plan's tables: columns with
    /// constraints, declared value domains and the relationship edges.
    fn schema_context(&self, plan: &Plan) -> Value {
        let mut tables = serde_json::Map::new();
        let mut relationships = Vec::new();
        let mut value_domains = serde_json::Map::new();

        for (table_name, table) in &plan.metadata_subset {
            let mut columns = serde_json::Map::new();
            let mut primary_key = None;

            for (col_name, col) in &table.columns {
                let mut constraints = Vec::new();
                if col.primary_key {
                    constraints.push("PRIMARY KEY".to_string());
                    primary_key = Some(col_name.clone());
                }
                if col.required {
                    constraints.push("NOT NULL".to_string());
                }
                if let Some(default) = &col.default {
                    constraints.push(format!("DEFAULT: {}", default));
                }

                let mut column = json!({
                    "type": col.col_type,
                    "constraints": constraints,
                });
                let column_doc = column.as_object_mut().expect("column is an object");
                if let Some(pattern) = &col.pattern {
                    column_doc.insert("pattern".to_string(), json!(pattern));
                }
                if !col.distinct_values.is_empty() {
                    column_doc.insert("valid_values".to_string(), json!(col.distinct_values));
                    value_domains.insert(
                        format!("{}.{}", table_name, col_name),
                        json!(col.distinct_values),
                    );
                }
                columns.insert(col_name.clone(), column);
            }

            let foreign_keys: Vec<Value> = table
                .foreign_keys
                .iter()
                .map(|fk| {
                    let edge = json!({
                        "from": format!("{}.{}", table_name, fk.column),
                        "to": fk.references,
                    });
                    relationships.push(edge.clone());
                    edge
                })
                .collect();

            tables.insert(
                table_name.clone(),
                json!({
                    "description": table.description,
                    "columns": columns,
                    "primary_key": primary_key,
                    "foreign_keys": foreign_keys,
                }),
            );
        }

        json!({
            "tables": tables,
            "relationships": relationships,
            "value_domains": value_domains,
        })
    }

    /// Ordered reasoning bullets computed from the plan and the FK graph.
    fn chain_of_thought(&self, question: &str, plan: &Plan) -> Vec<String> {
        let lower = question.to_lowercase();
        let mut steps = Vec::new();

        // Entity identification
        let entity_words: &[(&str, &str, &str)] = &[
            ("customer", "customers", "person who has accounts"),
            ("account", "accounts", "banking account"),
            ("branch", "branches", "bank location"),
            ("employee", "employees", "bank staff"),
            ("manager", "employees", "branch manager"),
            ("transaction", "transactions", "account activity"),
        ];
        let identified: Vec<String> = entity_words
            .iter()
            .filter(|(word, table, _)| {
                lower.contains(word) && plan.tables.iter().any(|t| t == table)
            })
            .map(|(word, _, description)| format!("{} ({})", word, description))
            .collect();
        if !identified.is_empty() {
            steps.push(format!("1. Identified entities: {}", identified.join(", ")));
        }

        // Schema mapping with key columns
        let mappings: Vec<String> = plan
            .tables
            .iter()
            .filter_map(|table| {
                let meta = plan.metadata_subset.get(table)?;
                let key_columns: Vec<&str> = meta
                    .columns
                    .iter()
                    .filter(|(_, c)| c.primary_key || c.required)
                    .map(|(name, _)| name.as_str())
                    .collect();
                if key_columns.is_empty() {
                    None
                } else {
                    Some(format!("{} (key columns: {})", table, key_columns.join(", ")))
                }
            })
            .collect();
        if !mappings.is_empty() {
            steps.push(format!("2. Required tables: {}", mappings.join(", ")));
        }

        // Join analysis over consecutive detected tables
        if plan.tables.len() > 1 {
            let graph = self.metadata.fk_graph();
            let joins: Vec<String> = plan
                .tables
                .windows(2)
                .filter_map(|pair| {
                    graph
                        .join_condition(&pair[0], &pair[1])
                        .map(|cond| format!("{} -> {} via {}", pair[0], pair[1], cond))
                })
                .collect();
            if !joins.is_empty() {
                steps.push(format!("3. Join path: {}", joins.join(" then ")));
            }
        }

        // Conditions implied by capabilities and value domains
        let mut conditions = Vec::new();
        if plan.capabilities.iter().any(|c| c == "aggregate") {
            conditions.push("Apply aggregation functions".to_string());
        }
        if plan.capabilities.iter().any(|c| c == "date_filter") {
            conditions.push("Add date range filters".to_string());
        }
        if plan.tables.iter().any(|t| t == "accounts" || t == "transactions") {
            conditions.push("Check status='active' where applicable".to_string());
        }
        for (table_name, table) in &plan.metadata_subset {
            for (col_name, col) in &table.columns {
                if col.distinct_values.is_empty() {
                    continue;
                }
                if col.distinct_values.iter().any(|v| lower.contains(&v.to_lowercase())) {
                    conditions.push(format!(
                        "Validate {}.{} against allowed values: {}",
                        table_name,
                        col_name,
                        col.distinct_values.join(", ")
                    ));
                }
            }
        }
        if !conditions.is_empty() {
            steps.push(format!("4. Required conditions: {}", conditions.join(", ")));
        }

        // Output planning
        let mut outputs = Vec::new();
        if plan.tables.iter().any(|t| t == "customers") {
            outputs.push("Concatenate first_name and last_name".to_string());
        }
        if plan.capabilities.iter().any(|c| c == "aggregate") {
            outputs.push("Include aggregated values".to_string());
        }
        if ["order", "sort", "rank"].iter().any(|w| lower.contains(w)) {
            outputs.push("Add ORDER BY clause".to_string());
        }
        if !outputs.is_empty() {
            steps.push(format!("5. Output formatting: {}", outputs.join(", ")));
        }

        if steps.is_empty() {
            // Generic fallback so the prompt never ships without guidance
            steps = vec![
                "1. Identify entities in the question".to_string(),
                "2. Map to relevant tables/columns".to_string(),
                "3. Plan necessary joins/filters".to_string(),
                "4. Determine output columns".to_string(),
                "5. Consider ordering and grouping".to_string(),
            ];
        }

        steps
    }
}

/// Keep only examples whose tables overlap the detected tables AND whose
/// keywords overlap the question tokens. Capped at two, corpus order.
fn relevant_examples<'a>(
    question: &str,
    tables: &[String],
    pool: &'a [QueryExample],
) -> Vec<&'a QueryExample> {
    let question_words: HashSet<String> = question
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();

    pool.iter()
        .filter(|ex| {
            let table_overlap = ex.tables_used.iter().any(|t| tables.iter().any(|d| d == t));
            let keyword_overlap = ex
                .nl_query
                .to_lowercase()
                .split_whitespace()
                .any(|w| question_words.contains(w));
            table_overlap && keyword_overlap
        })
        .take(2)
        .collect()
}
