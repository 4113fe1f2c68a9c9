//! Query Resolution Pipeline
//!
//! Plan -> Retrieve -> Generate -> Validate -> Execute -> Summarize, with a
//! bounded feedback-driven repair loop between generation and execution. The
//! orchestrator depends only on the per-stage capability traits, carries
//! diagnostics across stages, and never raises to the caller: every question
//! gets a `PipelineResult`, failed or not.
//!
//! ```text
//! question ──> Planner ──> Retriever ──> Generator ──┐
//!                                                    v
//!                    ┌── repair hint ──── Validator ─┤
//!                    └──> Generator ───── Executor ──┴──> Summarizer
//! ```

pub mod executor;
pub mod generator;
pub mod planner;
pub mod prompt;
pub mod retriever;
pub mod summarizer;
pub mod validator;


pub use executor::{ExecutionOutcome, Executor, SqlExecutor};
pub use generator::{Generator, LlmGenerator};
pub use planner::{KeywordPlanner, Plan, Planner};
pub use prompt::{HistoryEntry, PromptBuilder};
pub use retriever::{RetrievalBundle, Retriever, SchemaRetriever, build_retrieval_query};
pub use summarizer::{ResultSummarizer, Summarizer};
pub use validator::{SqlValidator, ValidationOutcome, Validator};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::models::{Diagnostics, PipelineResult};

/// Everything the generator needs for one request, rebuilt per attempt from
/// immutable parts.
#[derive(Debug, Clone)]
pub struct GenContext {
    pub plan: Plan,
    pub bundle: RetrievalBundle,
    pub clarified_values: BTreeMap<String, serde_json::Value>,
}

/// The pipeline orchestrator. Reentrant: all per-request state lives on the
/// stack of `run`.
pub struct QueryPipeline {
    planner: Arc<dyn Planner>,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    validator: Arc<dyn Validator>,
    executor: Arc<dyn Executor>,
    summarizer: Arc<dyn Summarizer>,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(
        planner: Arc<dyn Planner>,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        validator: Arc<dyn Validator>,
        executor: Arc<dyn Executor>,
        summarizer: Arc<dyn Summarizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self { planner, retriever, generator, validator, executor, summarizer, settings }
    }

    /// Resolve one question into a result envelope. `clarified_values`
    /// carries the caller's answers to clarifications from a prior turn.
    pub async fn run(
        &self,
        question: &str,
        clarified_values: BTreeMap<String, serde_json::Value>,
    ) -> PipelineResult {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.settings.request_timeout_secs);
        let mut diag = Diagnostics::default();

        tracing::info!(request_id = %request_id, "Pipeline run: {}", question);

        // 1) Plan (CPU-only, no deadline needed)
        let stage = Instant::now();
        let plan = self.planner.analyze(question);
        diag.timings_ms.insert("planning".to_string(), elapsed_ms(stage));
        diag.chosen_tables = plan.tables.clone();
        diag.detected_capabilities = plan.capabilities.clone();
        tracing::debug!(
            request_id = %request_id,
            "Plan: tables=[{}], capabilities=[{}]",
            plan.tables.join(", "),
            plan.capabilities.join(", ")
        );

        // 2) Retrieve schema context
        let stage = Instant::now();
        let retrieval_query = build_retrieval_query(question, &plan.tables);
        let Some(bundle) = with_deadline(deadline, self.retriever.fetch(&retrieval_query)).await
        else {
            return self.cancelled(question, plan, diag, started);
        };
        diag.timings_ms.insert("retrieval".to_string(), elapsed_ms(stage));

        let ctx = GenContext { plan, bundle, clarified_values };

        // 3) Generate SQL
        let stage = Instant::now();
        let Some(mut sql) = with_deadline(deadline, self.generator.generate(question, &ctx)).await
        else {
            return self.cancelled(question, ctx.plan, diag, started);
        };
        diag.generated_sql = Some(sql.clone());
        diag.timings_ms.insert("generation".to_string(), elapsed_ms(stage));

        // 4) Validate / execute with bounded repair
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            let stage = Instant::now();
            let Some(verdict) = with_deadline(deadline, self.validator.validate(&sql)).await
            else {
                return self.cancelled(question, ctx.plan, diag, started);
            };
            *diag.timings_ms.entry("validation".to_string()).or_insert(0) += elapsed_ms(stage);

            if !verdict.is_valid {
                let reason =
                    verdict.error.unwrap_or_else(|| "unknown validation error".to_string());
                tracing::warn!(request_id = %request_id, "Validation failed: {}", reason);
                diag.validator_fail_reasons.push(reason.clone());
                last_error = Some(reason.clone());
                attempts += 1;
                diag.retries = attempts;
                if attempts > self.settings.max_retries {
                    break;
                }
                let Some(repaired) = with_deadline(
                    deadline,
                    self.generator.repair(question, &ctx, &sql, &reason),
                )
                .await
                else {
                    return self.cancelled(question, ctx.plan, diag, started);
                };
                sql = repaired;
                continue;
            }

            let stage = Instant::now();
            let Some(exec) = with_deadline(
                deadline,
                self.executor.run(&sql, self.settings.sql_row_limit, &verdict),
            )
            .await
            else {
                return self.cancelled(question, ctx.plan, diag, started);
            };
            *diag.timings_ms.entry("execution".to_string()).or_insert(0) += elapsed_ms(stage);

            if exec.success {
                diag.final_sql = Some(sql.clone());
                diag.retries = attempts;

                // 5) Summarize (CPU-only)
                let stage = Instant::now();
                let summary = self.summarizer.summarize(question, &exec);
                diag.timings_ms.insert("summarization".to_string(), elapsed_ms(stage));
                diag.timings_ms.insert("total".to_string(), elapsed_ms(started));

                // Follow-ups for a populated result; the summarizer's
                // broadening hints when nothing matched.
                let suggestions = if exec.rows.is_empty() {
                    summary.suggestions
                } else {
                    ctx.plan.follow_ups.clone()
                };

                tracing::info!(
                    request_id = %request_id,
                    "Pipeline succeeded: {} rows, {} retries",
                    exec.rows.len(),
                    attempts
                );

                return PipelineResult {
                    success: true,
                    sql: Some(sql),
                    rows: exec.rows,
                    summary: Some(summary.text),
                    suggestions,
                    clarifications: ctx.plan.clarifications.clone(),
                    capabilities: ctx.plan.capabilities.clone(),
                    tables_used: verdict.tables_used,
                    error: None,
                    diagnostics: diag,
                };
            }

            let error = exec.error.unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(request_id = %request_id, "Execution failed: {}", error);
            diag.executor_errors.push(error.clone());
            last_error = Some(error.clone());
            attempts += 1;
            diag.retries = attempts;
            if attempts > self.settings.max_retries {
                break;
            }
            let Some(repaired) =
                with_deadline(deadline, self.generator.repair(question, &ctx, &sql, &error)).await
            else {
                return self.cancelled(question, ctx.plan, diag, started);
            };
            sql = repaired;
        }

        // Retry budget exhausted
        diag.timings_ms.insert("total".to_string(), elapsed_ms(started));
        tracing::warn!(request_id = %request_id, "Pipeline failed after {} attempts", attempts);

        PipelineResult {
            success: false,
            sql: Some(sql),
            rows: Vec::new(),
            summary: None,
            suggestions: ctx.plan.follow_ups.clone(),
            clarifications: ctx.plan.clarifications.clone(),
            capabilities: ctx.plan.capabilities.clone(),
            tables_used: Vec::new(),
            error: Some(last_error.unwrap_or_else(|| "Could not produce safe SQL".to_string())),
            diagnostics: diag,
        }
    }

    /// Deadline expiry: abort with partial diagnostics.
    fn cancelled(
        &self,
        question: &str,
        plan: Plan,
        mut diag: Diagnostics,
        started: Instant,
    ) -> PipelineResult {
        diag.timings_ms.insert("total".to_string(), elapsed_ms(started));
        tracing::warn!("Pipeline cancelled by deadline: {}", question);
        PipelineResult {
            success: false,
            sql: diag.generated_sql.clone(),
            rows: Vec::new(),
            summary: None,
            suggestions: plan.follow_ups,
            clarifications: plan.clarifications,
            capabilities: plan.capabilities,
            tables_used: Vec::new(),
            error: Some("cancelled".to_string()),
            diagnostics: diag,
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Run a stage under the remaining request budget. `None` means the deadline
/// passed before or during the stage.
async fn with_deadline<F, T>(deadline: Instant, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    tokio::time::timeout(deadline - now, fut).await.ok()
}
