//! Evaluation reports and the builder that keeps them consistent.

use serde::Serialize;
use uuid::Uuid;

use super::types::{DimensionOutcome, FailureKind, Stage};
use crate::aggregate::{AggregationPolicy, Overall};
use crate::dimension_map::DimensionMap;
use crate::extract::Score;
use crate::rubric::RubricCatalog;

/// Result of evaluating one subject against a catalog.
///
/// `per_dimension` and `scores` always share the same keys, in catalog order.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub id: Uuid,
    pub subject_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_name: Option<String>,
    #[serde(rename = "DOCUMENT")]
    pub per_dimension: DimensionMap<String>,
    #[serde(rename = "SCORES")]
    pub scores: DimensionMap<Score>,
    #[serde(rename = "OVERALL")]
    pub overall: Option<Overall>,
    pub outcomes: DimensionMap<DimensionOutcome>,
}

impl EvaluationReport {
    /// (dimension, explanation, score) in catalog order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &str, Score)> {
        self.per_dimension.iter().map(|(name, text)| {
            let score = self.scores.get(name).copied().unwrap_or_default();
            (name, text.as_str(), score)
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, FailureKind)> {
        self.outcomes
            .iter()
            .filter_map(|(name, o)| o.failure.map(|f| (name, f)))
    }
}

/// Everything recorded for one dimension.
#[derive(Debug, Clone)]
pub struct DimensionResult {
    pub explanation: String,
    pub score: Score,
    pub outcome: DimensionOutcome,
}

impl DimensionResult {
    pub fn not_applicable(explanation: impl Into<String>, outcome: DimensionOutcome) -> Self {
        Self {
            explanation: explanation.into(),
            score: Score::NotApplicable,
            outcome,
        }
    }
}

/// Collects per-dimension results in any order and emits them in catalog order.
///
/// Owned by exactly one evaluation; both maps are written by [`record`](Self::record)
/// only, so their key sets cannot diverge.
#[derive(Debug)]
pub struct ReportBuilder {
    id: Uuid,
    subject_name: String,
    secondary_name: Option<String>,
    names: Vec<String>,
    slots: Vec<Option<DimensionResult>>,
}

impl ReportBuilder {
    pub fn new(id: Uuid, subject_name: &str, secondary_name: Option<&str>, catalog: &RubricCatalog) -> Self {
        let names: Vec<String> = catalog.names().into_iter().map(String::from).collect();
        let slots = names.iter().map(|_| None).collect();
        Self {
            id,
            subject_name: subject_name.to_string(),
            secondary_name: secondary_name.map(String::from),
            names,
            slots,
        }
    }

    /// Record the result for the dimension at catalog position `index`.
    /// Out-of-range indices are ignored; a second record for a slot replaces the first.
    pub fn record(&mut self, index: usize, result: DimensionResult) {
        match self.slots.get_mut(index) {
            Some(slot) => *slot = Some(result),
            None => tracing::warn!(index, "dimension index outside catalog; result dropped"),
        }
    }

    pub fn finish(self, policy: &AggregationPolicy) -> EvaluationReport {
        let mut per_dimension = DimensionMap::new();
        let mut scores = DimensionMap::new();
        let mut outcomes = DimensionMap::new();

        for (name, slot) in self.names.into_iter().zip(self.slots) {
            let result = slot.unwrap_or_else(|| {
                DimensionResult::not_applicable(
                    "not evaluated",
                    DimensionOutcome::failed(Stage::NotStarted, FailureKind::Cancelled),
                )
            });
            per_dimension.insert(name.clone(), result.explanation);
            scores.insert(name.clone(), result.score);
            outcomes.insert(name, result.outcome);
        }

        let overall = Some(policy.aggregate(&scores));

        EvaluationReport {
            id: self.id,
            subject_name: self.subject_name,
            secondary_name: self.secondary_name,
            per_dimension,
            scores,
            overall,
            outcomes,
        }
    }
}
