//! Combining per-dimension scores into an overall grade.
//!
//! Two policies exist and they treat `N/A` differently: [`mean`] ignores it,
//! [`weighted`] counts it as zero. Flows pick one through [`AggregationPolicy`].

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::dimension_map::DimensionMap;
use crate::extract::Score;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("weights must sum to 1.0, got {0}")]
    WeightSum(f64),
    #[error("weight for {name:?} must be a finite non-negative number, got {value}")]
    InvalidWeight { name: String, value: f64 },
    #[error("duplicate weight for {0:?}")]
    DuplicateWeight(String),
}

// =============================================================================
// POLICIES
// =============================================================================

/// Unweighted mean over numeric scores. `None` when nothing was scored.
pub fn mean(scores: &DimensionMap<Score>) -> Option<f64> {
    let values: Vec<i64> = scores.values().filter_map(Score::value).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
}

/// Weighted sum. Missing and `N/A` dimensions contribute zero.
pub fn weighted(scores: &DimensionMap<Score>, weights: &Weights) -> f64 {
    weights
        .iter()
        .map(|(name, w)| {
            let s = scores.get(name).and_then(Score::value).unwrap_or(0);
            w * s as f64
        })
        .sum()
}

/// Per-dimension weights summing to one.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    weights: DimensionMap<f64>,
}

impl Weights {
    pub fn new<K: Into<String>>(weights: impl IntoIterator<Item = (K, f64)>) -> Result<Self, AggregateError> {
        let mut map = DimensionMap::new();
        for (name, value) in weights {
            let name = name.into();
            if !value.is_finite() || value < 0.0 {
                return Err(AggregateError::InvalidWeight { name, value });
            }
            if map.contains_key(&name) {
                return Err(AggregateError::DuplicateWeight(name));
            }
            map.insert(name, value);
        }

        let sum: f64 = map.values().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AggregateError::WeightSum(sum));
        }
        Ok(Self { weights: map })
    }

    /// Correctness 0.6, Comprehensiveness 0.2, Readability 0.2.
    pub fn qa_default() -> Self {
        Self {
            weights: [
                ("Correctness", 0.6),
                ("Comprehensiveness", 0.2),
                ("Readability", 0.2),
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.weights.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k, *v))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum AggregationPolicy {
    #[default]
    Mean,
    Weighted(Weights),
}

impl AggregationPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationPolicy::Mean => "mean",
            AggregationPolicy::Weighted(_) => "weighted",
        }
    }

    pub fn aggregate(&self, scores: &DimensionMap<Score>) -> Overall {
        let value = match self {
            AggregationPolicy::Mean => mean(scores),
            AggregationPolicy::Weighted(w) => Some(weighted(scores, w)),
        };
        Overall {
            policy: self.name(),
            value,
            scored: scores.values().filter(|s| s.is_applicable()).count(),
            total: scores.len(),
            explanation: render_overall(scores, value),
        }
    }
}

// =============================================================================
// OVERALL
// =============================================================================

/// Overall grade attached to a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overall {
    pub policy: &'static str,
    #[serde(rename = "score", serialize_with = "serialize_overall_value")]
    pub value: Option<f64>,
    pub scored: usize,
    pub total: usize,
    pub explanation: String,
}

fn serialize_overall_value<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_f64(*v),
        None => serializer.serialize_str("N/A"),
    }
}

/// e.g. `Overall: 2.60 (3 of 3 dimensions scored)`.
pub fn render_overall(scores: &DimensionMap<Score>, overall: Option<f64>) -> String {
    let scored = scores.values().filter(|s| s.is_applicable()).count();
    let value = match overall {
        Some(v) => format!("{v:.2}"),
        None => "N/A".to_string(),
    };
    format!(
        "Overall: {value} ({scored} of {} dimensions scored)",
        scores.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, Score)]) -> DimensionMap<Score> {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn mean_of_equal_scores() {
        let s = scores(&[("a", Score::Value(2)), ("b", Score::Value(2)), ("c", Score::Value(2))]);
        assert_eq!(mean(&s), Some(2.0));
    }

    #[test]
    fn mean_skips_na_and_reports_none_when_empty() {
        let s = scores(&[("a", Score::Value(4)), ("b", Score::NotApplicable)]);
        assert_eq!(mean(&s), Some(4.0));
        let none = scores(&[("a", Score::NotApplicable)]);
        assert_eq!(mean(&none), None);
    }

    #[test]
    fn weighted_qa_default() {
        let s = scores(&[
            ("Correctness", Score::Value(3)),
            ("Comprehensiveness", Score::Value(2)),
            ("Readability", Score::Value(2)),
        ]);
        let w = weighted(&s, &Weights::qa_default());
        assert!((w - 2.6).abs() < 1e-9);
    }

    #[test]
    fn weighted_counts_na_as_zero() {
        let s = scores(&[
            ("Correctness", Score::NotApplicable),
            ("Comprehensiveness", Score::Value(3)),
        ]);
        let w = weighted(&s, &Weights::qa_default());
        assert!((w - 0.6).abs() < 1e-9);
    }

    #[test]
    fn weights_must_sum_to_one() {
        assert!(matches!(
            Weights::new([("a", 0.5), ("b", 0.4)]),
            Err(AggregateError::WeightSum(_))
        ));
        assert!(Weights::new([("a", 0.5), ("b", 0.5)]).is_ok());
        assert!(matches!(
            Weights::new([("a", 1.5), ("b", -0.5)]),
            Err(AggregateError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn render_and_policy() {
        let s = scores(&[
            ("Correctness", Score::Value(3)),
            ("Comprehensiveness", Score::Value(2)),
            ("Readability", Score::Value(2)),
        ]);
        let overall = AggregationPolicy::Weighted(Weights::qa_default()).aggregate(&s);
        assert_eq!(overall.explanation, "Overall: 2.60 (3 of 3 dimensions scored)");
        assert_eq!(overall.policy, "weighted");

        let na = scores(&[("a", Score::NotApplicable)]);
        let overall = AggregationPolicy::Mean.aggregate(&na);
        assert_eq!(overall.explanation, "Overall: N/A (0 of 1 dimensions scored)");
        assert_eq!(
            serde_json::to_value(&overall).unwrap()["score"],
            serde_json::json!("N/A")
        );
    }
}
