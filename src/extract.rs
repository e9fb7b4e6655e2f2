//! Score extraction from free-text judgments.
//!
//! Judges rarely follow the output contract exactly. Extraction runs an ordered
//! chain of [`ScoreStrategy`]s and takes the first one that produces a value
//! inside the dimension's scale. An explicit `N/A` stops the chain. A value
//! outside the scale fails its strategy and is never clamped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::rubric::{Dimension, RubricCatalog};

// =============================================================================
// SCORE
// =============================================================================

/// A single dimension score: an integer on the dimension's scale, or `N/A`.
///
/// Serialises as a bare JSON integer or the string `"N/A"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Score {
    Value(i64),
    #[default]
    NotApplicable,
}

impl Score {
    pub fn value(&self) -> Option<i64> {
        match self {
            Score::Value(v) => Some(*v),
            Score::NotApplicable => None,
        }
    }

    pub fn is_applicable(&self) -> bool {
        matches!(self, Score::Value(_))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Value(v) => write!(f, "{v}"),
            Score::NotApplicable => f.write_str("N/A"),
        }
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Value(v) => serializer.serialize_i64(*v),
            Score::NotApplicable => serializer.serialize_str("N/A"),
        }
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Int(i64),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Int(v) => Ok(Score::Value(v)),
            Wire::Text(s) if s.trim().eq_ignore_ascii_case("n/a") => Ok(Score::NotApplicable),
            Wire::Text(s) => s
                .trim()
                .parse()
                .map(Score::Value)
                .map_err(|_| serde::de::Error::custom(format!("invalid score {s:?}"))),
        }
    }
}

// =============================================================================
// STRATEGIES
// =============================================================================

/// Extraction strategies, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStrategy {
    /// `Score` label followed by optional punctuation or markup and an integer,
    /// scoped to the dimension's heading when one is present.
    LiteralScoreLabel,
    /// The dimension name (optionally emphasised) followed by `:` or `-` and an integer.
    DimensionNameLabel,
    /// First integer after any `Score:` within the same paragraph.
    LooseScoreLabel,
}

pub const STRATEGY_CHAIN: [ScoreStrategy; 3] = [
    ScoreStrategy::LiteralScoreLabel,
    ScoreStrategy::DimensionNameLabel,
    ScoreStrategy::LooseScoreLabel,
];

/// What a single strategy made of the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    Value(i64),
    /// The judge explicitly answered `N/A`.
    NotApplicable,
    NoMatch,
}

static SCORE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bscore\b[ \t]*[*_]*[ \t]*(?:[:=]|-[ \t])?[ \t]*[*_]*[ \t]*(-?\d+(?:\.\d+)?|n/a)",
    )
    .expect("Invalid score label regex")
});

static LOOSE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bscore:").expect("Invalid loose score regex"));

static BLANK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n").expect("Invalid blank line regex"));

/// A line holding only a section label: `# Label`, `**Label**` or `Label:`.
static SECTION_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t>\-]*(?:#{1,6}[ \t]*(?P<md>[^\n]+?)|\*\*(?P<bold>[^*\n]+?)\*\*[ \t]*:?|[*_]*[ \t]*(?P<bare>[A-Za-z][A-Za-z0-9 &/'()\-]{0,60}?)[*_]*[ \t]*:[*_]*)[ \t]*$",
    )
    .expect("Invalid section heading regex")
});

/// Labels that belong inside a criterion block rather than opening a new one.
const FIELD_LABELS: &[&str] = &[
    "score",
    "explanation",
    "justification",
    "reasoning",
    "rationale",
    "feedback",
    "comment",
    "comments",
    "evidence",
    "notes",
];

impl ScoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreStrategy::LiteralScoreLabel => "literal_score_label",
            ScoreStrategy::DimensionNameLabel => "dimension_name_label",
            ScoreStrategy::LooseScoreLabel => "loose_score_label",
        }
    }

    /// Run this strategy alone.
    pub fn apply(&self, dimension_name: &str, text: &str, scale_min: i64, scale_max: i64) -> StrategyOutcome {
        self.apply_among(dimension_name, &[], text, scale_min, scale_max)
    }

    /// Run this strategy alone, treating `siblings` as the other criteria graded in the same text.
    pub fn apply_among(
        &self,
        dimension_name: &str,
        siblings: &[&str],
        text: &str,
        scale_min: i64,
        scale_max: i64,
    ) -> StrategyOutcome {
        let raw = match self {
            ScoreStrategy::LiteralScoreLabel => {
                literal_score_label(dimension_block(dimension_name, siblings, text))
            }
            ScoreStrategy::DimensionNameLabel => dimension_name_label(dimension_name, text),
            ScoreStrategy::LooseScoreLabel => {
                loose_score_label(dimension_block(dimension_name, siblings, text))
            }
        };
        match raw {
            None => StrategyOutcome::NoMatch,
            Some(token) if token.eq_ignore_ascii_case("n/a") => StrategyOutcome::NotApplicable,
            Some(token) => match token.parse::<i64>() {
                Ok(v) if (scale_min..=scale_max).contains(&v) => StrategyOutcome::Value(v),
                Ok(v) => {
                    tracing::debug!(
                        strategy = self.as_str(),
                        dimension = dimension_name,
                        value = v,
                        "score outside scale; strategy rejected"
                    );
                    StrategyOutcome::NoMatch
                }
                Err(_) => {
                    tracing::debug!(
                        strategy = self.as_str(),
                        dimension = dimension_name,
                        token,
                        "score is not a whole number; strategy rejected"
                    );
                    StrategyOutcome::NoMatch
                }
            },
        }
    }
}

fn heading_regex(dimension_name: &str) -> Option<Regex> {
    let pattern = format!(
        r"(?im)^[ \t\-*#_>]*{}[*_]*[ \t]*(?:[:\-]|$)",
        regex::escape(dimension_name)
    );
    Regex::new(&pattern).ok()
}

/// Line-leading heading for a dimension, e.g. `Correctness:` or `**Correctness**`.
fn heading_end(dimension_name: &str, text: &str) -> Option<usize> {
    heading_regex(dimension_name)?.find(text).map(|m| m.end())
}

fn heading_start(dimension_name: &str, text: &str) -> Option<usize> {
    heading_regex(dimension_name)?.find(text).map(|m| m.start())
}

/// The dimension's own block: from its heading up to the next block that belongs
/// to another criterion. The whole text when the dimension has no heading.
fn dimension_block<'t>(dimension_name: &str, siblings: &[&str], text: &'t str) -> &'t str {
    let Some(start) = heading_end(dimension_name, text) else {
        return text;
    };
    let block = &text[start..];
    let body = block.find('\n').map_or(block.len(), |i| i + 1);
    let end = next_block_start(dimension_name, siblings, &block[body..])
        .map_or(block.len(), |offset| body + offset);
    &block[..end]
}

/// Start of the first heading in `body` that opens another criterion: a sibling's
/// heading, or any section heading whose own block carries a score label.
fn next_block_start(dimension_name: &str, siblings: &[&str], body: &str) -> Option<usize> {
    let sibling = siblings
        .iter()
        .filter(|s| !s.eq_ignore_ascii_case(dimension_name))
        .filter_map(|s| heading_start(s, body))
        .min();

    let sections: Vec<(usize, usize)> = SECTION_HEADING
        .captures_iter(body)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let label = c
                .name("md")
                .or_else(|| c.name("bold"))
                .or_else(|| c.name("bare"))?
                .as_str()
                .trim_matches(|ch: char| ch == ':' || ch == '*' || ch == '_' || ch.is_whitespace());
            let is_field = FIELD_LABELS.iter().any(|f| label.eq_ignore_ascii_case(f));
            (!is_field && !label.eq_ignore_ascii_case(dimension_name))
                .then_some((whole.start(), whole.end()))
        })
        .collect();
    let scored = sections.iter().enumerate().find_map(|(i, &(start, end))| {
        let next = sections.get(i + 1).map_or(body.len(), |&(s, _)| s);
        SCORE_LABEL.is_match(&body[end..next]).then_some(start)
    });

    match (sibling, scored) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn literal_score_label(block: &str) -> Option<&str> {
    SCORE_LABEL
        .captures(block)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn dimension_name_label<'t>(dimension_name: &str, text: &'t str) -> Option<&'t str> {
    let pattern = format!(
        r"(?i)[*_]*{}[*_]*\s*(?::|-\s)\s*(?:score_obtained\s*:\s*)?[*_]*\s*(-?\d+(?:\.\d+)?|n/a)",
        regex::escape(dimension_name)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// First number after a `Score:` label in the same paragraph, sign and fraction
/// included so that the scale check sees the value as written.
fn loose_score_label(text: &str) -> Option<&str> {
    for label in LOOSE_LABEL.find_iter(text) {
        let rest = &text[label.end()..];
        let Some(digit) = rest.find(|c: char| c.is_ascii_digit()) else {
            return None;
        };
        if BLANK_LINE.is_match(&rest[..digit]) {
            continue;
        }
        let start = if rest[..digit].ends_with('-') { digit - 1 } else { digit };
        let mut end = digit + digits_len(&rest[digit..]);
        if let Some(fraction) = rest[end..].strip_prefix('.') {
            let len = digits_len(fraction);
            if len > 0 {
                end += 1 + len;
            }
        }
        return Some(&rest[start..end]);
    }
    None
}

fn digits_len(s: &str) -> usize {
    s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len())
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// Extraction result with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedScore {
    pub dimension: String,
    pub value: Score,
    /// Strategy that decided the value; `None` when nothing matched.
    pub strategy: Option<ScoreStrategy>,
}

impl ExtractedScore {
    /// Nothing in the text looked like a score.
    pub fn is_ambiguous(&self) -> bool {
        self.strategy.is_none()
    }
}

pub fn extract(dimension_name: &str, text: &str, scale_min: i64, scale_max: i64) -> Score {
    extract_detailed(dimension_name, text, scale_min, scale_max).value
}

pub fn extract_detailed(
    dimension_name: &str,
    text: &str,
    scale_min: i64,
    scale_max: i64,
) -> ExtractedScore {
    extract_among(dimension_name, &[], text, scale_min, scale_max)
}

/// Extraction from a judgment that grades several criteria at once. A heading
/// for any of `siblings` closes the dimension's block.
pub fn extract_among(
    dimension_name: &str,
    siblings: &[&str],
    text: &str,
    scale_min: i64,
    scale_max: i64,
) -> ExtractedScore {
    for strategy in STRATEGY_CHAIN {
        let value = match strategy.apply_among(dimension_name, siblings, text, scale_min, scale_max) {
            StrategyOutcome::NoMatch => continue,
            StrategyOutcome::Value(v) => Score::Value(v),
            StrategyOutcome::NotApplicable => Score::NotApplicable,
        };
        return ExtractedScore {
            dimension: dimension_name.to_string(),
            value,
            strategy: Some(strategy),
        };
    }

    ExtractedScore {
        dimension: dimension_name.to_string(),
        value: Score::NotApplicable,
        strategy: None,
    }
}

/// [`extract_detailed`] using the dimension's own name and scale.
pub fn extract_for(dimension: &Dimension, text: &str) -> ExtractedScore {
    extract_detailed(dimension.name(), text, dimension.scale_min(), dimension.scale_max())
}

/// [`extract_among`] with the rest of `catalog` as siblings.
pub fn extract_in(dimension: &Dimension, catalog: &RubricCatalog, text: &str) -> ExtractedScore {
    let siblings = catalog.names();
    extract_among(
        dimension.name(),
        &siblings,
        text,
        dimension.scale_min(),
        dimension.scale_max(),
    )
}
