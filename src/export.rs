//! CSV export of evaluation reports and submission grades.

use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluate::EvaluationReport;
use crate::grading::SubmissionGrade;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub const REPORT_HEADER: [&str; 3] = ["dimension", "score", "explanation"];
pub const GRADES_HEADER: [&str; 5] = ["Full Name", "User ID", "Email", "Total Score", "Feedback"];

/// One learner row of a gradebook upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRow {
    pub full_name: String,
    pub user_id: String,
    pub email: String,
    pub total_score: f64,
    pub feedback: String,
}

impl GradeRow {
    pub fn from_submission(
        full_name: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        grade: &SubmissionGrade,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            user_id: user_id.into(),
            email: email.into(),
            total_score: grade.total_score,
            feedback: grade.feedback.clone(),
        }
    }
}

/// Quote a field when it holds a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_record<W: Write, S: AsRef<str>>(writer: &mut W, fields: &[S]) -> Result<(), ExportError> {
    let line = fields
        .iter()
        .map(|f| csv_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    write!(writer, "{line}\r\n")?;
    Ok(())
}

/// One row per dimension in catalog order, then an `overall` row.
pub fn report_to_csv<W: Write>(report: &EvaluationReport, mut writer: W) -> Result<(), ExportError> {
    write_record(&mut writer, &REPORT_HEADER)?;
    for (name, explanation, score) in report.rows() {
        write_record(&mut writer, &[name, &score.to_string(), explanation])?;
    }
    if let Some(overall) = &report.overall {
        let value = match overall.value {
            Some(v) => format!("{v:.2}"),
            None => "N/A".to_string(),
        };
        write_record(&mut writer, &["overall", value.as_str(), overall.explanation.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn grades_to_csv<W: Write>(rows: &[GradeRow], mut writer: W) -> Result<(), ExportError> {
    write_record(&mut writer, &GRADES_HEADER)?;
    for row in rows {
        let total = format!("{:.2}", row.total_score);
        write_record(
            &mut writer,
            &[
                row.full_name.as_str(),
                row.user_id.as_str(),
                row.email.as_str(),
                total.as_str(),
                row.feedback.as_str(),
            ],
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationPolicy;
    use crate::evaluate::{DimensionOutcome, DimensionResult, FailureKind, ReportBuilder, Stage};
    use crate::extract::Score;
    use crate::rubric::{Dimension, RubricCatalog};
    use uuid::Uuid;

    #[test]
    fn fields_are_quoted_only_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn report_rows_follow_catalog_order() {
        let catalog = RubricCatalog::new(vec![
            Dimension::new("Clarity", "", 1, 5).unwrap(),
            Dimension::new("Pacing", "", 1, 5).unwrap(),
        ])
        .unwrap();
        let mut builder = ReportBuilder::new(Uuid::new_v4(), "lecture", None, &catalog);
        builder.record(
            1,
            DimensionResult::not_applicable(
                "context unavailable",
                DimensionOutcome::failed(Stage::Retrieving, FailureKind::RetrievalUnavailable),
            ),
        );
        builder.record(
            0,
            DimensionResult {
                explanation: "Clear, well paced".to_string(),
                score: Score::Value(4),
                outcome: DimensionOutcome {
                    stage: Stage::Done,
                    failure: None,
                    strategy: None,
                    cached: false,
                    latency_ms: 0,
                },
            },
        );
        let report = builder.finish(&AggregationPolicy::Mean);

        let mut out = Vec::new();
        report_to_csv(&report, &mut out).unwrap();
        let csv = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = csv.split("\r\n").collect();
        assert_eq!(lines[0], "dimension,score,explanation");
        assert_eq!(lines[1], "Clarity,4,\"Clear, well paced\"");
        assert_eq!(lines[2], "Pacing,N/A,context unavailable");
        assert!(lines[3].starts_with("overall,4.00,"));
    }

    #[test]
    fn gradebook_columns() {
        let rows = vec![GradeRow {
            full_name: "Ada Lovelace".into(),
            user_id: "42".into(),
            email: "ada@example.org".into(),
            total_score: 5.2,
            feedback: "Q1: good | Q2: N/A (timeout)".into(),
        }];
        let mut out = Vec::new();
        grades_to_csv(&rows, &mut out).unwrap();
        let csv = String::from_utf8(out).unwrap();
        assert!(csv.starts_with("Full Name,User ID,Email,Total Score,Feedback\r\n"));
        assert!(csv.contains("Ada Lovelace,42,ada@example.org,5.20,Q1: good | Q2: N/A (timeout)\r\n"));
    }
}
