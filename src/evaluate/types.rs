//! Request, configuration and outcome types for rubric evaluation.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::aggregate::AggregationPolicy;
use crate::extract::ScoreStrategy;
use crate::gateway::SamplingParams;
use crate::rubric::{RubricCatalog, RubricError};

pub const DEFAULT_MODEL: &str = "llama3.1";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 32;
pub const DEFAULT_DIMENSION_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Backend model id.
    pub model: String,
    /// Dimensions evaluated at once. Clamped to `1..=MAX_CONCURRENCY`.
    pub concurrency: usize,
    /// Budget for one dimension, retrieval through generation.
    pub dimension_timeout: Duration,
    pub max_output_tokens: Option<u32>,
    pub sampling: SamplingParams,
    /// Context passages are cut to this many tokens before prompting.
    pub max_context_tokens: Option<usize>,
    pub aggregation: AggregationPolicy,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            dimension_timeout: DEFAULT_DIMENSION_TIMEOUT,
            max_output_tokens: None,
            sampling: SamplingParams::deterministic(),
            max_context_tokens: None,
            aggregation: AggregationPolicy::Mean,
        }
    }
}

impl EvaluatorConfig {
    /// Defaults, with the model taken from `RUBRIC_LLM_MODEL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(model) = std::env::var("RUBRIC_LLM_MODEL") {
            if !model.trim().is_empty() {
                config.model = model.trim().to_string();
            }
        }
        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dimension_timeout(mut self, timeout: Duration) -> Self {
        self.dimension_timeout = timeout;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn with_max_context_tokens(mut self, max: usize) -> Self {
        self.max_context_tokens = Some(max);
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationPolicy) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub subject_name: String,
    /// Entity the subject is compared with, e.g. a job description.
    pub secondary_name: Option<String>,
    pub dimensions: RubricCatalog,
}

impl EvaluationRequest {
    pub fn new(subject_name: impl Into<String>, dimensions: RubricCatalog) -> Self {
        Self {
            subject_name: subject_name.into(),
            secondary_name: None,
            dimensions,
        }
    }

    pub fn with_secondary(mut self, secondary_name: impl Into<String>) -> Self {
        let name = secondary_name.into();
        self.secondary_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), EvaluationError> {
        if self.subject_name.trim().is_empty() {
            return Err(EvaluationError::InvalidRequest(
                "subject name must not be blank".to_string(),
            ));
        }
        if self.dimensions.is_empty() {
            return Err(EvaluationError::InvalidRequest(
                "at least one dimension is required".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Furthest stage a dimension reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Retrieving,
    Prompting,
    Generating,
    Extracting,
    Done,
}

impl Stage {
    const ORDER: [Stage; 6] = [
        Stage::NotStarted,
        Stage::Retrieving,
        Stage::Prompting,
        Stage::Generating,
        Stage::Extracting,
        Stage::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NotStarted => "not_started",
            Stage::Retrieving => "retrieving",
            Stage::Prompting => "prompting",
            Stage::Generating => "generating",
            Stage::Extracting => "extracting",
            Stage::Done => "done",
        }
    }
}

/// Stage of an in-flight dimension, still readable once its future is dropped
/// by a timeout.
#[derive(Debug)]
pub struct StageTracker(AtomicU8);

impl StageTracker {
    pub fn new() -> Self {
        Self(AtomicU8::new(Stage::NotStarted as u8))
    }

    pub fn enter(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    pub fn current(&self) -> Stage {
        let raw = self.0.load(Ordering::Relaxed) as usize;
        Stage::ORDER.get(raw).copied().unwrap_or(Stage::NotStarted)
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Recoverable failures. Each turns the affected dimension into `N/A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetrievalUnavailable,
    GenerationFailure,
    ExtractionAmbiguous,
    MalformedSubmission,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RetrievalUnavailable => "retrieval_unavailable",
            FailureKind::GenerationFailure => "generation_failure",
            FailureKind::ExtractionAmbiguous => "extraction_ambiguous",
            FailureKind::MalformedSubmission => "malformed_submission",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionOutcome {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ScoreStrategy>,
    pub cached: bool,
    pub latency_ms: u64,
}

impl DimensionOutcome {
    pub fn failed(stage: Stage, failure: FailureKind) -> Self {
        Self {
            stage,
            failure: Some(failure),
            strategy: None,
            cached: false,
            latency_ms: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Request-level failures. Per-dimension failures never surface here.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Rubric(#[from] RubricError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::{Dimension, RubricCatalog};

    #[test]
    fn blank_subject_is_invalid() {
        let catalog = RubricCatalog::single(Dimension::new("A", "", 0, 3).unwrap());
        let err = EvaluationRequest::new("   ", catalog).validate().unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidRequest(_)));
    }

    #[test]
    fn empty_catalog_is_invalid() {
        let catalog = RubricCatalog::new(vec![]).unwrap();
        assert!(EvaluationRequest::new("x", catalog).validate().is_err());
    }

    #[test]
    fn stage_tracker_reports_last_entered_stage() {
        let tracker = StageTracker::new();
        assert_eq!(tracker.current(), Stage::NotStarted);
        for stage in Stage::ORDER {
            tracker.enter(stage);
            assert_eq!(tracker.current(), stage);
        }
        assert_eq!(Stage::Prompting.as_str(), "prompting");
        assert_eq!(serde_json::to_string(&Stage::Extracting).unwrap(), "\"extracting\"");
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(EvaluatorConfig::default().with_concurrency(0).effective_concurrency(), 1);
        assert_eq!(EvaluatorConfig::default().with_concurrency(500).effective_concurrency(), 32);
        assert_eq!(EvaluatorConfig::default().effective_concurrency(), 4);
    }

    #[test]
    fn blank_secondary_is_dropped() {
        let catalog = RubricCatalog::single(Dimension::new("A", "", 0, 3).unwrap());
        let req = EvaluationRequest::new("cv", catalog).with_secondary("  ");
        assert!(req.secondary_name.is_none());
    }
}
