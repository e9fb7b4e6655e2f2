#![forbid(unsafe_code)]

//! # rubric-harness
//!
//! Turn free-text LLM judgments into auditable numeric scores.
//!
//! A subject (a lecture transcript, a resume, a student answer) is evaluated
//! against a catalog of rubric dimensions. Each dimension gets its own retrieved
//! context, its own prompt and its own generation; scores are pulled out of the
//! judgment text by a chain of extraction strategies and combined into an
//! overall grade. A failure on one dimension is reported as `N/A` and never
//! takes the rest of the report down with it.

pub mod aggregate;
pub mod cache;
pub mod context;
pub mod dimension_map;
pub mod evaluate;
pub mod export;
pub mod extract;
pub mod gateway;
pub mod grading;
pub mod logging;
pub mod prompts;
pub mod rubric;
pub mod segment;
pub mod tokens;
pub mod trace;
pub mod variants;

pub use aggregate::{AggregationPolicy, Overall, Weights};
pub use cache::{JudgmentCache, JudgmentCacheKey, SqliteJudgmentCache};
pub use context::{ContextProvider, HttpContextProvider, StaticContextProvider};
pub use dimension_map::DimensionMap;
pub use evaluate::{
    EvaluationError, EvaluationReport, EvaluationRequest, Evaluator, EvaluatorConfig, FailureKind,
    Stage,
};
pub use extract::{extract, extract_for, extract_in, Score, ScoreStrategy};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use grading::{Grader, GradingError, PairGrade, SubmissionGrade};
pub use rubric::{Dimension, RubricCatalog, RubricError};
pub use segment::{segment, QaUnit};
pub use trace::{DimensionTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
