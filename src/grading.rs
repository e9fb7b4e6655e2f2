//! Question/answer submission grading.
//!
//! A submission is segmented into units, each unit is graded with one
//! generation covering every criterion of the QA catalog, and the unit
//! grades are summed into a submission total with per-question feedback.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::aggregate::{AggregationPolicy, Overall, Weights};
use crate::context::{join_passages, ContextError, ContextProvider};
use crate::dimension_map::DimensionMap;
use crate::evaluate::EvaluatorConfig;
use crate::extract::{extract_in, Score};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::prompts::{PromptInput, QA_PAIR_V1};
use crate::rubric::{self, RubricCatalog};
use crate::segment::{segment_with_diagnostics, QaUnit};
use crate::tokens::truncate_to_tokens;

pub const NO_SUBMISSION: &str = "No submission";
const FEEDBACK_SEPARATOR: &str = " | ";

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("context retrieval failed: {0}")]
    Context(#[from] ContextError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("grading timed out after {0:?}")]
    Timeout(Duration),
}

/// Grade of a single question/answer unit.
#[derive(Debug, Clone, Serialize)]
pub struct PairGrade {
    /// Raw judgment covering every criterion.
    pub explanation: String,
    pub scores: DimensionMap<Score>,
    pub overall: Overall,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitGrade {
    /// 1-based position in the submission.
    pub index: usize,
    pub unit: QaUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<PairGrade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitGrade {
    /// Contribution to the submission total. Failed units count zero.
    pub fn points(&self) -> f64 {
        self.grade
            .as_ref()
            .and_then(|g| g.overall.value)
            .unwrap_or(0.0)
    }

    pub fn feedback(&self) -> String {
        match (&self.grade, &self.error) {
            (Some(grade), _) => format!("Q{}: {}", self.index, grade.explanation.trim()),
            (None, Some(error)) => format!("Q{}: N/A ({error})", self.index),
            (None, None) => format!("Q{}: N/A", self.index),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionGrade {
    pub units: Vec<UnitGrade>,
    pub total_score: f64,
    pub feedback: String,
    /// Fragments the segmenter could not pair.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub malformed: Vec<String>,
}

pub struct Grader {
    gateway: Arc<dyn ChatGateway>,
    context: Arc<dyn ContextProvider>,
    config: EvaluatorConfig,
    catalog: RubricCatalog,
}

impl Grader {
    /// Grades with the QA catalog and the default QA weights.
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        context: Arc<dyn ContextProvider>,
        config: EvaluatorConfig,
    ) -> Self {
        let config = match config.aggregation {
            AggregationPolicy::Mean => config.with_aggregation(AggregationPolicy::Weighted(Weights::qa_default())),
            AggregationPolicy::Weighted(_) => config,
        };
        Self {
            gateway,
            context,
            config,
            catalog: rubric::qa_pair(),
        }
    }

    /// Replace the criteria. The aggregation policy must name the same dimensions.
    pub fn with_catalog(mut self, catalog: RubricCatalog, aggregation: AggregationPolicy) -> Self {
        self.catalog = catalog;
        self.config.aggregation = aggregation;
        self
    }

    pub fn catalog(&self) -> &RubricCatalog {
        &self.catalog
    }

    pub async fn grade_pair(&self, unit: &QaUnit) -> Result<PairGrade, GradingError> {
        let timeout = self.config.dimension_timeout;
        tokio::time::timeout(timeout, self.grade_pair_inner(unit))
            .await
            .map_err(|_| GradingError::Timeout(timeout))?
    }

    async fn grade_pair_inner(&self, unit: &QaUnit) -> Result<PairGrade, GradingError> {
        let query = match unit {
            QaUnit::Pair { question, .. } => question.as_str(),
            QaUnit::Raw { raw_text } => raw_text.as_str(),
        };
        let passages = self.context.retrieve(query).await?;
        let mut context = join_passages(&passages);
        if context.is_empty() {
            tracing::debug!("no reference context; grading on the answer alone");
            context = "No reference context was retrieved.".to_string();
        }
        if let Some(max) = self.config.max_context_tokens {
            context = truncate_to_tokens(&context, max);
        }

        let unit_text = unit.prompt_text();
        let prompt = QA_PAIR_V1.render(&PromptInput::criteria(
            &unit_text,
            &context,
            self.catalog.as_slice(),
        ));

        let mut request = ChatRequest::new(
            self.config.model.clone(),
            prompt.to_messages(),
            Attribution::new("grading::pair"),
        )
        .sampling(self.config.sampling);
        if let Some(max) = self.config.max_output_tokens {
            request = request.max_tokens(max);
        }

        let response = self.gateway.chat(request).await?;
        let text = response.content;

        let scores: DimensionMap<Score> = self
            .catalog
            .iter()
            .map(|dim| (dim.name(), extract_in(dim, &self.catalog, &text).value))
            .collect();
        let overall = self.config.aggregation.aggregate(&scores);

        Ok(PairGrade {
            explanation: text,
            scores,
            overall,
        })
    }

    pub async fn grade_submission(&self, text: &str) -> SubmissionGrade {
        let segmented = segment_with_diagnostics(text);
        if segmented.units.is_empty() {
            return SubmissionGrade {
                units: Vec::new(),
                total_score: 0.0,
                feedback: NO_SUBMISSION.to_string(),
                malformed: segmented.dropped,
            };
        }

        // `buffered` keeps submission order while grading concurrently.
        let units: Vec<UnitGrade> = stream::iter(segmented.units.into_iter().enumerate().map(
            |(i, unit)| async move {
                match self.grade_pair(&unit).await {
                    Ok(grade) => UnitGrade {
                        index: i + 1,
                        unit,
                        grade: Some(grade),
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!(question = i + 1, error = %e, "unit grading failed");
                        UnitGrade {
                            index: i + 1,
                            unit,
                            grade: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            },
        ))
        .buffered(self.config.effective_concurrency())
        .collect()
        .await;

        let total_score = units.iter().map(UnitGrade::points).sum();
        let feedback = units
            .iter()
            .map(UnitGrade::feedback)
            .collect::<Vec<_>>()
            .join(FEEDBACK_SEPARATOR);

        tracing::info!(
            units = units.len(),
            failed = units.iter().filter(|u| u.grade.is_none()).count(),
            total_score,
            "submission graded"
        );

        SubmissionGrade {
            units,
            total_score,
            feedback,
            malformed: segmented.dropped,
        }
    }
}
