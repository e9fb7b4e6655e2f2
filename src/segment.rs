//! Splitting raw submission text into question/answer units.
//!
//! Submissions are free text with `Q1:` / `A1:` style markers at line start.
//! Markers are case-insensitive, accept `:`, `.` or `)` after the index, and
//! tolerate spaces (`q 1 :`). A question runs until the next marker; an answer
//! runs until the next question marker, so multi-line answers survive intact.
//!
//! When no well-formed unit is found the whole trimmed input becomes a single
//! [`QaUnit::Raw`] so the caller can still grade it as one block.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t]*([qa])[ \t]*(\d+)[ \t]*[:.)](?:\s|$)").expect("Invalid QA marker regex")
});

/// One gradable unit of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QaUnit {
    Pair { question: String, answer: String },
    /// Degraded mode: no structure was recognised.
    Raw { raw_text: String },
}

impl QaUnit {
    pub fn pair(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self::Pair {
            question: question.into(),
            answer: answer.into(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. })
    }

    /// Text handed to the grading prompt.
    pub fn prompt_text(&self) -> String {
        match self {
            Self::Pair { question, answer } => format!("Question: {question}\nAnswer: {answer}"),
            Self::Raw { raw_text } => raw_text.clone(),
        }
    }
}

/// Segmentation result plus the fragments that were dropped as malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentReport {
    pub units: Vec<QaUnit>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Question,
    Answer,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    kind: MarkerKind,
    index: u32,
    start: usize,
    body_start: usize,
}

fn find_markers(text: &str) -> Vec<Marker> {
    MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = match caps.get(1)?.as_str() {
                "q" | "Q" => MarkerKind::Question,
                _ => MarkerKind::Answer,
            };
            let index = caps.get(2)?.as_str().parse().ok()?;
            Some(Marker {
                kind,
                index,
                start: whole.start(),
                body_start: whole.end(),
            })
        })
        .collect()
}

pub fn segment(text: &str) -> Vec<QaUnit> {
    segment_with_diagnostics(text).units
}

pub fn segment_with_diagnostics(text: &str) -> SegmentReport {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return SegmentReport::default();
    }

    let markers = find_markers(text);
    let mut report = SegmentReport::default();

    let mut i = 0;
    while i < markers.len() {
        let marker = markers[i];
        let next_start = markers.get(i + 1).map_or(text.len(), |m| m.start);

        match marker.kind {
            MarkerKind::Answer => {
                let fragment = text[marker.start..next_start].trim().to_string();
                tracing::warn!(index = marker.index, "answer marker without a question; dropping");
                report.dropped.push(fragment);
                i += 1;
            }
            MarkerKind::Question => {
                let answer = markers.get(i + 1).filter(|m| m.kind == MarkerKind::Answer);
                let Some(answer) = answer.copied() else {
                    let fragment = text[marker.start..next_start].trim().to_string();
                    tracing::warn!(index = marker.index, "question marker without an answer; dropping");
                    report.dropped.push(fragment);
                    i += 1;
                    continue;
                };

                if answer.index != marker.index {
                    tracing::debug!(
                        question = marker.index,
                        answer = answer.index,
                        "answer index differs from question index"
                    );
                }

                // The answer absorbs everything up to the next question marker.
                let mut j = i + 2;
                while j < markers.len() && markers[j].kind == MarkerKind::Answer {
                    j += 1;
                }
                let answer_end = markers.get(j).map_or(text.len(), |m| m.start);

                let question = text[marker.body_start..answer.start].trim();
                let answer_text = text[answer.body_start.min(answer_end)..answer_end].trim();
                if question.is_empty() || answer_text.is_empty() {
                    tracing::warn!(
                        index = marker.index,
                        empty_question = question.is_empty(),
                        empty_answer = answer_text.is_empty(),
                        "question or answer body is empty; dropping"
                    );
                    report
                        .dropped
                        .push(text[marker.start..answer_end].trim().to_string());
                } else {
                    report.units.push(QaUnit::pair(question, answer_text));
                }
                i = j;
            }
        }
    }

    if report.units.is_empty() {
        report.units.push(QaUnit::Raw {
            raw_text: trimmed.to_string(),
        });
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_well_formed_pairs() {
        let units = segment("Q1: What is X?\nA1: It is Y.\nQ2: What is Z?\nA2: It is W.");
        assert_eq!(
            units,
            vec![
                QaUnit::pair("What is X?", "It is Y."),
                QaUnit::pair("What is Z?", "It is W."),
            ]
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(segment("").is_empty());
        assert!(segment("   \n\t ").is_empty());
    }

    #[test]
    fn unstructured_text_falls_back_to_raw() {
        let units = segment("  just an essay about things  ");
        assert_eq!(
            units,
            vec![QaUnit::Raw {
                raw_text: "just an essay about things".to_string()
            }]
        );
    }

    #[test]
    fn marker_variants_are_accepted() {
        let text = "q 1 . first?\na1) one\nQ2 : second?\nA 2: two";
        let units = segment(text);
        assert_eq!(
            units,
            vec![QaUnit::pair("first?", "one"), QaUnit::pair("second?", "two")]
        );
    }

    #[test]
    fn multiline_answers_are_kept() {
        let text = "Q1: Explain.\nA1: Line one.\nLine two.\n\nLine three.\nQ2: Next?\nA2: Done.";
        let units = segment(text);
        assert_eq!(units.len(), 2);
        assert_eq!(
            units[0],
            QaUnit::pair("Explain.", "Line one.\nLine two.\n\nLine three.")
        );
    }

    #[test]
    fn question_without_answer_is_dropped() {
        let text = "Q1: Orphan?\nQ2: Paired?\nA2: Yes.";
        let report = segment_with_diagnostics(text);
        assert_eq!(report.units, vec![QaUnit::pair("Paired?", "Yes.")]);
        assert_eq!(report.dropped, vec!["Q1: Orphan?".to_string()]);
    }

    #[test]
    fn sole_malformed_unit_becomes_raw() {
        let report = segment_with_diagnostics("Q1: Nobody answered this");
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(
            report.units,
            vec![QaUnit::Raw {
                raw_text: "Q1: Nobody answered this".to_string()
            }]
        );
    }

    #[test]
    fn mismatched_indices_still_pair() {
        let units = segment("Q1: a?\nA2: b");
        assert_eq!(units, vec![QaUnit::pair("a?", "b")]);
    }

    #[test]
    fn empty_answer_body_is_dropped() {
        let report = segment_with_diagnostics("Q1: What is X?\nA1:\nQ2: What is Z?\nA2: It is W.");
        assert_eq!(report.units, vec![QaUnit::pair("What is Z?", "It is W.")]);
        assert_eq!(report.dropped, vec!["Q1: What is X?\nA1:".to_string()]);

        let report = segment_with_diagnostics("Q1:\nA1: Floating answer.\nQ2: Kept?\nA2: Yes.");
        assert_eq!(report.units, vec![QaUnit::pair("Kept?", "Yes.")]);
        assert_eq!(report.dropped.len(), 1);
    }

    #[test]
    fn decimals_are_not_markers() {
        let units = segment("Q1: Value of pi?\nA1: About\na 3.14 estimate");
        assert_eq!(units, vec![QaUnit::pair("Value of pi?", "About\na 3.14 estimate")]);
    }

    #[test]
    fn n_markers_give_n_units() {
        let text: String = (1..=7)
            .map(|i| format!("Q{i}: question {i}\nA{i}: answer {i}\n"))
            .collect();
        assert_eq!(segment(&text).len(), 7);
    }
}
