//! Rubric evaluation orchestrator.
//!
//! For every dimension of a request: retrieve context, render the prompt,
//! generate a judgment and extract a score. Dimensions are independent; a
//! failure in one becomes `N/A` for that dimension and never aborts the rest.

pub mod report;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::cache::{CachedJudgment, JudgmentCache, JudgmentCacheKey};
use crate::context::{context_query, join_passages, ContextProvider};
use crate::extract::extract_for;
use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::prompts::{template_for, PromptInput, PromptTemplate};
use crate::rubric::Dimension;
use crate::tokens::truncate_to_tokens;
use crate::trace::{now_epoch_ms, DimensionTrace, TraceSink};

pub use report::{DimensionResult, EvaluationReport, ReportBuilder};
pub use types::*;

pub const CONTEXT_UNAVAILABLE: &str = "context unavailable";
pub const CANCELLED: &str = "cancelled";

pub struct Evaluator {
    gateway: Arc<dyn ChatGateway>,
    context: Arc<dyn ContextProvider>,
    config: EvaluatorConfig,
    cache: Option<Arc<dyn JudgmentCache>>,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Per-request values shared by every dimension task.
struct RequestScope<'a> {
    id: Uuid,
    subject_name: &'a str,
    secondary_name: Option<&'a str>,
    extra_names: Vec<String>,
    template: PromptTemplate,
    template_hash: String,
}

/// Token usage and provenance collected alongside a [`DimensionResult`].
#[derive(Default)]
struct CallStats {
    input_tokens: u32,
    output_tokens: u32,
    error: Option<String>,
}

impl Evaluator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        context: Arc<dyn ContextProvider>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            gateway,
            context,
            config,
            cache: None,
            trace: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn JudgmentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub async fn evaluate(&self, req: EvaluationRequest) -> Result<EvaluationReport, EvaluationError> {
        let never = AtomicBool::new(false);
        self.evaluate_with_cancel(req, &never).await
    }

    /// Like [`evaluate`](Self::evaluate), but dimensions that have not started
    /// when `cancel` is set are reported as `N/A` ("cancelled").
    pub async fn evaluate_with_cancel(
        &self,
        req: EvaluationRequest,
        cancel: &AtomicBool,
    ) -> Result<EvaluationReport, EvaluationError> {
        req.validate()?;

        let id = Uuid::new_v4();
        let start = Instant::now();
        let extra_names: Vec<String> = req.secondary_name.iter().cloned().collect();
        let template = template_for(&extra_names);
        let scope = RequestScope {
            id,
            subject_name: &req.subject_name,
            secondary_name: req.secondary_name.as_deref(),
            template_hash: template.template_hash(),
            extra_names,
            template,
        };

        tracing::debug!(
            request_id = %id,
            subject = %req.subject_name,
            dimensions = req.dimensions.len(),
            template = template.slug,
            "evaluation started"
        );

        let timeout = self.config.dimension_timeout;
        let results = stream::iter(req.dimensions.iter().enumerate().map(|(index, dim)| {
            let scope = &scope;
            async move {
                if cancel.load(AtomicOrdering::Relaxed) {
                    let result = DimensionResult::not_applicable(
                        CANCELLED,
                        DimensionOutcome::failed(Stage::NotStarted, FailureKind::Cancelled),
                    );
                    return (index, result, CallStats::default());
                }

                let dim_start = Instant::now();
                let tracker = StageTracker::new();
                let (mut result, stats) = match tokio::time::timeout(
                    timeout,
                    self.evaluate_dimension(scope, dim, &tracker),
                )
                .await
                {
                    Ok(done) => done,
                    Err(_) => timed_out(dim, tracker.current(), timeout),
                };
                result.outcome.latency_ms = dim_start.elapsed().as_millis() as u64;
                (index, result, stats)
            }
        }))
        .buffer_unordered(self.config.effective_concurrency())
        .collect::<Vec<_>>()
        .await;

        let mut builder = ReportBuilder::new(id, &req.subject_name, scope.secondary_name, &req.dimensions);
        for (index, result, stats) in results {
            if let (Some(trace), Some(dim)) = (&self.trace, req.dimensions.as_slice().get(index)) {
                let event = self.build_trace(&scope, index, dim, &result, stats);
                if let Err(e) = trace.record(event) {
                    tracing::warn!(error = %e, "failed to record dimension trace");
                }
            }
            builder.record(index, result);
        }

        let report = builder.finish(&self.config.aggregation);
        tracing::info!(
            request_id = %id,
            subject = %report.subject_name,
            dimensions = report.scores.len(),
            scored = report.scores.values().filter(|s| s.is_applicable()).count(),
            latency_ms = start.elapsed().as_millis() as u64,
            "evaluation finished"
        );
        Ok(report)
    }

    async fn evaluate_dimension(
        &self,
        scope: &RequestScope<'_>,
        dim: &Dimension,
        tracker: &StageTracker,
    ) -> (DimensionResult, CallStats) {
        tracker.enter(Stage::Retrieving);
        let query = context_query(scope.subject_name, dim.name(), scope.secondary_name);
        let context = match self.context.retrieve(&query).await {
            Ok(passages) => join_passages(&passages),
            Err(e) => {
                tracing::warn!(dimension = dim.name(), error = %e, "context retrieval failed");
                let result = DimensionResult::not_applicable(
                    CONTEXT_UNAVAILABLE,
                    DimensionOutcome::failed(Stage::Retrieving, FailureKind::RetrievalUnavailable),
                );
                let stats = CallStats {
                    error: Some(e.to_string()),
                    ..CallStats::default()
                };
                return (result, stats);
            }
        };
        if context.trim().is_empty() {
            tracing::warn!(dimension = dim.name(), "no context retrieved");
            let result = DimensionResult::not_applicable(
                CONTEXT_UNAVAILABLE,
                DimensionOutcome::failed(Stage::Retrieving, FailureKind::RetrievalUnavailable),
            );
            return (result, CallStats::default());
        }
        let context = match self.config.max_context_tokens {
            Some(max) => truncate_to_tokens(&context, max),
            None => context,
        };

        tracker.enter(Stage::Prompting);
        let input = PromptInput::dimension(scope.subject_name, &context, dim)
            .with_extra_names(&scope.extra_names);
        let prompt = scope.template.render(&input);

        tracker.enter(Stage::Generating);
        let cache_key = self.cache.as_ref().map(|_| {
            JudgmentCacheKey::new(
                &self.config.model,
                scope.template.slug,
                &scope.template_hash,
                dim,
                scope.subject_name,
                scope.secondary_name,
                &context,
            )
        });

        let mut cached = false;
        let mut stats = CallStats::default();
        let mut judgment: Option<String> = None;

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key).await {
                Ok(Some(hit)) => {
                    tracing::debug!(dimension = dim.name(), "judgment cache hit");
                    stats.input_tokens = hit.input_tokens.unwrap_or(0);
                    stats.output_tokens = hit.output_tokens.unwrap_or(0);
                    judgment = Some(hit.text);
                    cached = true;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "judgment cache read failed; calling backend"),
            }
        }

        let text = match judgment {
            Some(text) => text,
            None => {
                let mut request = ChatRequest::new(
                    self.config.model.clone(),
                    prompt.to_messages(),
                    Attribution::new("evaluate::dimension").with_request(scope.id),
                )
                .sampling(self.config.sampling);
                if let Some(max) = self.config.max_output_tokens {
                    request = request.max_tokens(max);
                }

                match self.gateway.chat(request).await {
                    Ok(response) => {
                        stats.input_tokens = response.input_tokens;
                        stats.output_tokens = response.output_tokens;
                        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                            let entry = CachedJudgment {
                                text: response.content.clone(),
                                input_tokens: Some(response.input_tokens),
                                output_tokens: Some(response.output_tokens),
                            };
                            if let Err(e) = cache.put(key, &entry).await {
                                tracing::warn!(error = %e, "judgment cache write failed");
                            }
                        }
                        response.content
                    }
                    Err(e) => {
                        tracing::warn!(dimension = dim.name(), error = %e, "generation failed");
                        let message = e.to_string();
                        stats.error = Some(message.clone());
                        let result = DimensionResult::not_applicable(
                            message,
                            DimensionOutcome::failed(Stage::Generating, FailureKind::GenerationFailure),
                        );
                        return (result, stats);
                    }
                }
            }
        };

        tracker.enter(Stage::Extracting);
        let extracted = extract_for(dim, &text);
        let failure = if extracted.is_ambiguous() {
            tracing::debug!(dimension = dim.name(), "no score found in judgment");
            Some(FailureKind::ExtractionAmbiguous)
        } else {
            None
        };

        tracker.enter(Stage::Done);
        let result = DimensionResult {
            explanation: text,
            score: extracted.value,
            outcome: DimensionOutcome {
                stage: Stage::Done,
                failure,
                strategy: extracted.strategy,
                cached,
                latency_ms: 0,
            },
        };
        (result, stats)
    }

    fn build_trace(
        &self,
        scope: &RequestScope<'_>,
        index: usize,
        dim: &Dimension,
        result: &DimensionResult,
        stats: CallStats,
    ) -> DimensionTrace {
        DimensionTrace {
            timestamp_ms: now_epoch_ms(),
            request_id: scope.id,
            subject_name: scope.subject_name.to_string(),
            dimension: dim.name().to_string(),
            dimension_index: index,
            prompt_template_slug: scope.template.slug.to_string(),
            template_hash: scope.template_hash.clone(),
            model: self.config.model.clone(),
            stage: result.outcome.stage,
            failure: result.outcome.failure,
            score: result.score,
            strategy: result.outcome.strategy,
            cached: result.outcome.cached,
            latency_ms: result.outcome.latency_ms,
            input_tokens: stats.input_tokens,
            output_tokens: stats.output_tokens,
            error: stats.error,
        }
    }
}

/// Outcome for a dimension whose budget ran out at `stage`.
fn timed_out(dim: &Dimension, stage: Stage, timeout: Duration) -> (DimensionResult, CallStats) {
    let (failure, message) = match stage {
        Stage::NotStarted | Stage::Retrieving => (
            FailureKind::RetrievalUnavailable,
            format!("context retrieval timed out after {timeout:?}"),
        ),
        _ => (
            FailureKind::GenerationFailure,
            format!("generation timed out after {timeout:?}"),
        ),
    };
    tracing::warn!(dimension = dim.name(), stage = stage.as_str(), "{message}");
    let result = DimensionResult::not_applicable(message.clone(), DimensionOutcome::failed(stage, failure));
    let stats = CallStats {
        error: Some(message),
        ..CallStats::default()
    };
    (result, stats)
}
