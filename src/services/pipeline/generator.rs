//! SQL Generator - LLM-backed generation with heuristic fallbacks
//!
//! Turns a question plus its generation context into a syntactically legal,
//! safe SQL string. The primary path renders the structured prompt and calls
//! the LLM, validating (including a LIMIT 1 smoke run) after every attempt
//! with a rising temperature. When the model is exhausted the generator falls
//! back to column elimination on the last error, then to a small set of
//! question templates, and finally to the safe literal `SELECT 1;`.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::GenContext;
use super::prompt::{HistoryEntry, PromptBuilder, RepairContext};
use super::validator::Validator;
use crate::services::llm::{GenerateOptions, LanguageModel};
use crate::services::metadata::MetadataStore;

/// The sentinel returned when every strategy failed. Still a legal read-only
/// statement, so the pipeline terminates cleanly.
pub const FALLBACK_SQL: &str = "SELECT 1;";

/// Generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Never fails; on total failure returns `SELECT 1;`.
    async fn generate(&self, question: &str, ctx: &GenContext) -> String;

    /// Repair attempt carrying the previous SQL and the literal error.
    async fn repair(&self, question: &str, ctx: &GenContext, previous_sql: &str, hint: &str)
    -> String;
}

// ============================================================================
// LLM Response Parsing
// ============================================================================

/// Parsed model output. Both `SQLQuery` and `Suggestion` are required
/// non-empty; a missing `Reasoning` block is non-fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    #[serde(rename = "SQLQuery")]
    pub sql: String,
    #[serde(rename = "Suggestion")]
    pub suggestion: String,
    #[serde(rename = "Reasoning", default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<serde_json::Value>,
}

/// Strip a single outermost markdown fence, if present. Inner backticks are
/// legal and preserved.
pub(crate) fn clean_llm_response(response: &str) -> &str {
    let trimmed = response.trim();
    match trimmed.strip_prefix("```") {
        None => trimmed,
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest).trim();
            rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
        },
    }
}

/// Accepts raw JSON or fence-wrapped JSON; rejects replies missing either
/// required field.
pub(crate) fn parse_llm_reply(response: &str) -> Option<LlmReply> {
    let cleaned = clean_llm_response(response);
    let mut reply: LlmReply = serde_json::from_str(cleaned).ok()?;
    reply.sql = reply.sql.trim().to_string();
    reply.suggestion = reply.suggestion.trim().to_string();
    if reply.sql.is_empty() || reply.suggestion.is_empty() {
        tracing::warn!("LLM response missing required fields");
        return None;
    }
    Some(reply)
}

// ============================================================================
// LLM Generator
// ============================================================================

pub struct LlmGenerator {
    metadata: Arc<MetadataStore>,
    llm: Arc<dyn LanguageModel>,
    validator: Arc<dyn Validator>,
    prompt_builder: Arc<Mutex<PromptBuilder>>,
    base_temperature: f64,
    max_llm_attempts: u32,
    max_tokens: u32,
}

impl LlmGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<MetadataStore>,
        llm: Arc<dyn LanguageModel>,
        validator: Arc<dyn Validator>,
        prompt_builder: Arc<Mutex<PromptBuilder>>,
        base_temperature: f64,
        max_llm_attempts: u32,
        max_tokens: u32,
    ) -> Self {
        Self {
            metadata,
            llm,
            validator,
            prompt_builder,
            base_temperature,
            max_llm_attempts,
            max_tokens,
        }
    }

    /// The LLM attempt loop: prompt, call, parse, validate (with smoke run),
    /// feeding each failure into the next attempt's error context.
    async fn llm_attempts(
        &self,
        question: &str,
        ctx: &GenContext,
        initial_repair: Option<RepairContext>,
        attempts: u32,
    ) -> Result<(String, String), (Option<String>, Option<String>)> {
        let mut repair_ctx = initial_repair;
        let mut last_sql: Option<String> = None;
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let prompt = {
                let builder = self.prompt_builder.lock().await;
                builder.build_prompt(
                    question,
                    &ctx.plan,
                    &ctx.bundle.exemplars,
                    &ctx.clarified_values,
                    repair_ctx.as_ref(),
                )
            };

            let opts = GenerateOptions::default()
                .with_temperature(self.base_temperature + 0.1 * attempt as f64)
                .with_max_tokens(self.max_tokens);
            tracing::debug!(
                "LLM generation attempt {} (temperature {:.2})",
                attempt + 1,
                opts.temperature
            );

            let response = match self.llm.generate_text(&prompt, &opts).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("LLM attempt {} transport failure: {}", attempt + 1, e);
                    last_error = Some(e.to_string());
                    continue;
                },
            };

            let Some(reply) = parse_llm_reply(&response) else {
                tracing::warn!("LLM attempt {} returned unparseable response", attempt + 1);
                last_error = Some("Invalid response format".to_string());
                continue;
            };

            let verdict = self.validator.validate(&reply.sql).await;
            if verdict.is_valid {
                return Ok((reply.sql, reply.suggestion));
            }

            let error = verdict.error.unwrap_or_else(|| "unknown validation error".to_string());
            tracing::warn!("LLM attempt {} failed validation: {}", attempt + 1, error);
            repair_ctx = Some(RepairContext::build(&reply.sql, &error, &self.metadata));
            last_sql = Some(reply.sql);
            last_error = Some(error);
        }

        Err((last_sql, last_error))
    }

    /// Heuristic repair then pattern fallback, shared by generate and repair.
    async fn degraded_paths(
        &self,
        question: &str,
        last_sql: Option<&str>,
        last_error: Option<&str>,
    ) -> String {
        if let (Some(sql), Some(error)) = (last_sql, last_error) {
            let simplified = exclude_problem_columns(sql, error);
            if simplified != sql {
                tracing::info!("Trying simplified query with problematic columns excluded");
                if self.validator.validate(&simplified).await.is_valid {
                    self.record_history(HistoryEntry::new(
                        question,
                        &simplified,
                        "Simplified query with problematic columns excluded",
                        true,
                    ))
                    .await;
                    return simplified;
                }
            }
        }

        if let Some((sql, suggestion)) = self.pattern_fallback(question)
            && self.validator.validate(&sql).await.is_valid
        {
            tracing::info!("Generated SQL via pattern matching");
            self.record_history(HistoryEntry::new(question, &sql, &suggestion, true)).await;
            return sql;
        }

        self.record_history(
            HistoryEntry::new(question, FALLBACK_SQL, "Default fallback query", false)
                .with_error(last_error.unwrap_or("generation exhausted")),
        )
        .await;
        FALLBACK_SQL.to_string()
    }

    /// Closed template set for question shapes the model keeps missing.
    fn pattern_fallback(&self, question: &str) -> Option<(String, String)> {
        let lower = question.to_lowercase();

        if lower.contains("branch")
            && lower.contains("manager")
            && self.metadata.has_table("branches")
            && self.metadata.has_table("employees")
        {
            let sql = "SELECT b.name AS branch_name, e.name AS manager_name \
                       FROM branches b \
                       LEFT JOIN employees e ON b.manager_id = e.id AND e.position = 'Branch Manager' \
                       ORDER BY b.name;"
                .to_string();
            let suggestion = "Lists all bank branches with their manager names, keeping \
                              branches without managers via a LEFT JOIN, ordered by branch name."
                .to_string();
            return Some((sql, suggestion));
        }

        if (lower.contains("both") || lower.contains("multiple"))
            && lower.contains("account")
            && self.metadata.has_table("accounts")
            && self.metadata.has_table("customers")
        {
            let mentioned: Vec<&String> = self
                .metadata
                .distinct_values("accounts", "type")
                .iter()
                .filter(|t| lower.contains(&t.to_lowercase()))
                .collect();

            if mentioned.len() >= 2 {
                let mut joins = Vec::new();
                let mut conditions = Vec::new();
                for (i, account_type) in mentioned.iter().enumerate() {
                    let alias = format!("a{}", i + 1);
                    joins.push(format!(
                        "JOIN accounts {alias} ON c.id = {alias}.customer_id AND {alias}.status = 'active'"
                    ));
                    conditions.push(format!("{alias}.type = '{account_type}'"));
                }
                let sql = format!(
                    "SELECT DISTINCT c.first_name || ' ' || c.last_name AS customer_name \
                     FROM customers c {} WHERE {} ORDER BY customer_name;",
                    joins.join(" "),
                    conditions.join(" AND ")
                );
                let suggestion = format!(
                    "Finds customers holding all of these account types: {}. Only active \
                     accounts are considered; names are distinct and ordered.",
                    mentioned
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                return Some((sql, suggestion));
            }
        }

        None
    }

    async fn record_history(&self, entry: HistoryEntry) {
        self.prompt_builder.lock().await.record(entry);
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, question: &str, ctx: &GenContext) -> String {
        match self
            .llm_attempts(question, ctx, None, self.max_llm_attempts)
            .await
        {
            Ok((sql, suggestion)) => {
                tracing::info!("Generated SQL via LLM");
                self.record_history(HistoryEntry::new(question, &sql, &suggestion, true))
                    .await;
                sql
            },
            Err((last_sql, last_error)) => {
                tracing::warn!("All LLM generation attempts failed");
                self.degraded_paths(question, last_sql.as_deref(), last_error.as_deref())
                    .await
            },
        }
    }

    async fn repair(
        &self,
        question: &str,
        ctx: &GenContext,
        previous_sql: &str,
        hint: &str,
    ) -> String {
        let initial = RepairContext::build(previous_sql, hint, &self.metadata);

        // Fewer attempts for repair; the pipeline loop bounds the outer budget.
        let attempts = self.max_llm_attempts.min(2).max(1);
        match self.llm_attempts(question, ctx, Some(initial), attempts).await {
            Ok((sql, suggestion)) => {
                tracing::info!("Repaired SQL via LLM");
                self.record_history(HistoryEntry::new(question, &sql, &suggestion, true))
                    .await;
                sql
            },
            Err((last_sql, last_error)) => {
                let sql = last_sql.as_deref().or(Some(previous_sql));
                let error = last_error.as_deref().or(Some(hint));
                self.degraded_paths(question, sql, error).await
            },
        }
    }
}

// ============================================================================
// Heuristic Column Elimination
// ============================================================================

const COLUMN_ERROR_PATTERNS: &[&str] = &[
    r"no such column: (\w+)",
    r"column (\w+) does not exist",
    r"ambiguous column name: (\w+)",
];

/// Column names the error message blames.
fn extract_problem_columns(error: &str) -> Vec<String> {
    let lower = error.to_lowercase();
    let mut columns = Vec::new();
    for pattern in COLUMN_ERROR_PATTERNS {
        let re = Regex::new(pattern).expect("invalid column error pattern");
        for caps in re.captures_iter(&lower) {
            let column = caps[1].to_string();
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
    }
    columns
}

/// Strip the blamed columns from the SELECT list, leaving FROM/WHERE and the
/// rest of the statement untouched. Returns the input unchanged when the
/// error names no columns or the statement has no SELECT...FROM span.
pub(crate) fn exclude_problem_columns(sql: &str, error: &str) -> String {
    let columns = extract_problem_columns(error);
    if columns.is_empty() {
        return sql.to_string();
    }

    let lower = sql.to_lowercase();
    let Some(select_start) = lower.find("select") else { return sql.to_string() };
    let Some(from_start) = lower[select_start..].find("from").map(|i| i + select_start) else {
        return sql.to_string();
    };

    let mut select_clause = sql[select_start..from_start].to_string();
    for column in &columns {
        let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(column)))
            .expect("invalid column regex");
        select_clause = re.replace_all(&select_clause, "").to_string();
    }

    // Tidy the comma debris left behind
    let double_comma = Regex::new(r",\s*,").expect("invalid comma regex");
    loop {
        let tidied = double_comma.replace_all(&select_clause, ",").to_string();
        if tidied == select_clause {
            break;
        }
        select_clause = tidied;
    }
    let leading = Regex::new(r"(?i)(select\s+(?:distinct\s+)?)\s*,\s*").expect("invalid regex");
    select_clause = leading.replace(&select_clause, "$1").to_string();
    let trailing = Regex::new(r",\s*$").expect("invalid regex");
    select_clause = trailing.replace(&select_clause, " ").to_string();

    tracing::info!("Excluded problematic columns: {}", columns.join(", "));
    format!("{}{}", select_clause, &sql[from_start..])
}

#[cfg(test)]
mod tests {
    use super::super::planner::{KeywordPlanner, Planner};
    use super::super::retriever::RetrievalBundle;
    use super::super::validator::SqlValidator;
    use super::*;
    use crate::services::llm::LlmError;
    use crate::services::metadata::{MetadataStore, SchemaMetadata};
    use crate::services::pipeline::prompt::example_corpus;
    use sqlx::SqlitePool;
    use std::collections::VecDeque;

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    #[test]
    fn parses_raw_json() {
        let reply = parse_llm_reply(
            r#"{"SQLQuery": "SELECT 1", "Suggestion": "trivial", "Reasoning": {"identified_entities": []}}"#,
        )
        .expect("should parse");
        assert_eq!(reply.sql, "SELECT 1");
        assert_eq!(reply.suggestion, "trivial");
        assert!(reply.reasoning.is_some());
    }

    #[test]
    fn parses_fenced_json_round_trip() {
        let reply = LlmReply {
            sql: "SELECT name FROM branches;".to_string(),
            suggestion: "Branch names".to_string(),
            reasoning: None,
        };
        let raw = serde_json::to_string(&reply).unwrap();

        for wrapped in [
            raw.clone(),
            format!("```json\n{}\n```", raw),
            format!("```\n{}\n```", raw),
        ] {
            let parsed = parse_llm_reply(&wrapped).expect("should parse wrapped");
            assert_eq!(parsed.sql, reply.sql);
            assert_eq!(parsed.suggestion, reply.suggestion);
        }
    }

    #[test]
    fn inner_backticks_survive_fence_stripping() {
        let raw = r#"```json
{"SQLQuery": "SELECT '```' AS fence", "Suggestion": "literal backticks"}
```"#;
        let parsed = parse_llm_reply(raw).expect("should parse");
        assert_eq!(parsed.sql, "SELECT '```' AS fence");
    }

    #[test]
    fn missing_reasoning_is_fine_missing_suggestion_is_not() {
        assert!(parse_llm_reply(r#"{"SQLQuery": "SELECT 1", "Suggestion": "ok"}"#).is_some());
        assert!(parse_llm_reply(r#"{"SQLQuery": "SELECT 1"}"#).is_none());
        assert!(parse_llm_reply(r#"{"SQLQuery": "", "Suggestion": "ok"}"#).is_none());
        assert!(parse_llm_reply("not json at all").is_none());
    }

    // ------------------------------------------------------------------
    // Column elimination
    // ------------------------------------------------------------------

    #[test]
    fn strips_blamed_column_from_select_list() {
        let repaired = exclude_problem_columns(
            "SELECT id, full_name, email FROM customers WHERE id > 3",
            "no such column: full_name",
        );
        assert!(!repaired.contains("full_name"));
        assert!(repaired.contains("id,"));
        assert!(repaired.contains("email"));
        assert!(repaired.contains("FROM customers WHERE id > 3"));
        assert!(!repaired.contains(", ,"));
    }

    #[test]
    fn leading_column_removal_keeps_select_sane() {
        let repaired = exclude_problem_columns(
            "SELECT full_name, email FROM customers",
            "no such column: full_name",
        );
        assert!(repaired.to_lowercase().starts_with("select"));
        assert!(!repaired.contains("full_name"));
        assert!(repaired.contains("email"));
        let after_select = repaired[6..].trim_start();
        assert!(!after_select.starts_with(','));
    }

    #[test]
    fn unrelated_error_leaves_sql_unchanged() {
        let sql = "SELECT id FROM customers";
        assert_eq!(exclude_problem_columns(sql, "near \"FORM\": syntax error"), sql);
    }

    #[test]
    fn ambiguous_column_pattern_matches() {
        let repaired = exclude_problem_columns(
            "SELECT id, name FROM customers JOIN accounts ON 1=1",
            "ambiguous column name: id",
        );
        assert!(!repaired.contains("id,"));
    }

    // ------------------------------------------------------------------
    // Generator flow with scripted model
    // ------------------------------------------------------------------

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
        temperatures: Mutex<Vec<f64>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
                temperatures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate_text(
            &self,
            prompt: &str,
            opts: &GenerateOptions,
        ) -> Result<String, LlmError> {
            self.prompts.lock().await.push(prompt.to_string());
            self.temperatures.lock().await.push(opts.temperature);
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(LlmError::ApiError("script exhausted".to_string())))
        }

        async fn generate_embeddings(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    fn store() -> Arc<MetadataStore> {
        let metadata: SchemaMetadata =
            serde_json::from_str(include_str!("../../../data/metadata.json")).unwrap();
        Arc::new(MetadataStore::from_metadata(metadata).unwrap())
    }

    async fn banking_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        for ddl in [
            "CREATE TABLE branches (id INTEGER PRIMARY KEY, name TEXT, city TEXT, state TEXT, manager_id INTEGER)",
            "CREATE TABLE employees (id INTEGER PRIMARY KEY, name TEXT, position TEXT, salary REAL, branch_id INTEGER, hire_date TEXT)",
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, first_name TEXT, last_name TEXT, email TEXT, phone TEXT, city TEXT, branch_id INTEGER)",
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, customer_id INTEGER, branch_id INTEGER, account_number TEXT, type TEXT, balance REAL, status TEXT, opened_at TEXT)",
            "CREATE TABLE transactions (id INTEGER PRIMARY KEY, account_id INTEGER, employee_id INTEGER, type TEXT, amount REAL, status TEXT, created_at TEXT)",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        pool
    }

    async fn generator_with(model: Arc<ScriptedModel>, attempts: u32) -> LlmGenerator {
        let metadata = store();
        let pool = banking_pool().await;
        let validator = Arc::new(SqlValidator::new(Arc::clone(&metadata), pool));
        let prompt_builder =
            Arc::new(Mutex::new(PromptBuilder::new(Arc::clone(&metadata), 3)));
        LlmGenerator::new(metadata, model, validator, prompt_builder, 0.1, attempts, 512)
    }

    fn gen_ctx(question: &str) -> GenContext {
        let plan = KeywordPlanner::new(store()).analyze(question);
        GenContext {
            plan,
            bundle: RetrievalBundle {
                exemplars: example_corpus().to_vec(),
                ..Default::default()
            },
            clarified_values: Default::default(),
        }
    }

    fn reply(sql: &str) -> Result<String, LlmError> {
        Ok(format!(r#"{{"SQLQuery": "{}", "Suggestion": "generated"}}"#, sql))
    }

    #[tokio::test]
    async fn first_valid_reply_wins() {
        let model = Arc::new(ScriptedModel::new(vec![reply("SELECT name FROM branches")]));
        let generator = generator_with(Arc::clone(&model), 3).await;
        let ctx = gen_ctx("List branches");
        let sql = generator.generate("List branches", &ctx).await;
        assert_eq!(sql, "SELECT name FROM branches");
        assert_eq!(model.prompts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn temperature_ramps_across_attempts() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::ApiError("down".to_string())),
            Ok("not json".to_string()),
            reply("SELECT name FROM branches"),
        ]));
        let generator = generator_with(Arc::clone(&model), 3).await;
        let ctx = gen_ctx("List branches");
        let sql = generator.generate("List branches", &ctx).await;
        assert_eq!(sql, "SELECT name FROM branches");
        let temps = model.temperatures.lock().await;
        assert_eq!(temps.len(), 3);
        assert!((temps[0] - 0.1).abs() < 1e-9);
        assert!((temps[1] - 0.2).abs() < 1e-9);
        assert!((temps[2] - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_attempt_feeds_error_context_into_next_prompt() {
        let model = Arc::new(ScriptedModel::new(vec![
            reply("SELECT full_name FROM customers"),
            reply("SELECT first_name || ' ' || last_name AS full_name FROM customers"),
        ]));
        let generator = generator_with(Arc::clone(&model), 3).await;
        let ctx = gen_ctx("List customer names");
        let sql = generator.generate("List customer names", &ctx).await;
        assert!(sql.contains("first_name || ' ' || last_name"));

        let prompts = model.prompts.lock().await;
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("error_context"));
        assert!(prompts[1].contains("error_context"));
        assert!(prompts[1].contains("SELECT full_name FROM customers"));
        assert!(prompts[1].contains("full_name"));
        assert!(prompts[1].contains("column_not_found"));
    }

    #[tokio::test]
    async fn pattern_fallback_for_branch_managers() {
        // Model never produces anything useful
        let model = Arc::new(ScriptedModel::new(vec![]));
        let generator = generator_with(model, 2).await;
        let ctx = gen_ctx("List all branches and their managers.");
        let sql = generator.generate("List all branches and their managers.", &ctx).await;
        assert!(sql.contains("LEFT JOIN employees"));
        assert!(sql.contains("b.manager_id = e.id"));
        assert!(sql.contains("Branch Manager"));
        assert!(sql.contains("ORDER BY b.name"));
    }

    #[tokio::test]
    async fn pattern_fallback_for_both_account_types() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let generator = generator_with(model, 1).await;
        let question = "Find customers who have both checking and savings accounts.";
        let ctx = gen_ctx(question);
        let sql = generator.generate(question, &ctx).await;
        assert!(sql.contains("JOIN accounts a1"));
        assert!(sql.contains("JOIN accounts a2"));
        assert!(sql.contains("a1.type = 'checking'"));
        assert!(sql.contains("a2.type = 'savings'"));
        assert!(sql.contains("a1.status = 'active'"));
        assert!(sql.contains("DISTINCT"));
    }

    #[tokio::test]
    async fn hopeless_question_falls_back_to_select_one() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let generator = generator_with(model, 1).await;
        let ctx = gen_ctx("completely unanswerable");
        let sql = generator.generate("completely unanswerable", &ctx).await;
        assert_eq!(sql, FALLBACK_SQL);
    }

    #[tokio::test]
    async fn heuristic_repair_strips_bad_column_when_llm_exhausted() {
        let model = Arc::new(ScriptedModel::new(vec![
            reply("SELECT id, full_name FROM customers"),
            reply("SELECT id, full_name FROM customers"),
            reply("SELECT id, full_name FROM customers"),
        ]));
        let generator = generator_with(model, 3).await;
        let ctx = gen_ctx("List customer ids");
        let sql = generator.generate("List customer ids", &ctx).await;
        assert!(!sql.contains("full_name"));
        assert!(sql.contains("id"));
        assert!(sql.contains("FROM customers"));
    }

    #[tokio::test]
    async fn repair_prompt_carries_hint_and_previous_sql() {
        let model = Arc::new(ScriptedModel::new(vec![reply("SELECT name FROM branches")]));
        let generator = generator_with(Arc::clone(&model), 3).await;
        let ctx = gen_ctx("List branches");
        let sql = generator
            .repair("List branches", &ctx, "SELECT nme FROM branches", "no such column: nme")
            .await;
        assert_eq!(sql, "SELECT name FROM branches");
        let prompts = model.prompts.lock().await;
        assert!(prompts[0].contains("error_context"));
        assert!(prompts[0].contains("SELECT nme FROM branches"));
        assert!(prompts[0].contains("no such column: nme"));
    }

    #[tokio::test]
    async fn successful_generation_recorded_in_history() {
        let model = Arc::new(ScriptedModel::new(vec![reply("SELECT name FROM branches")]));
        let generator = generator_with(model, 1).await;
        let ctx = gen_ctx("List branches");
        generator.generate("List branches", &ctx).await;
        let builder = generator.prompt_builder.lock().await;
        assert_eq!(builder.history().len(), 1);
        assert!(builder.history()[0].success);
        assert_eq!(builder.history()[0].sql, "SELECT name FROM branches");
    }
}
