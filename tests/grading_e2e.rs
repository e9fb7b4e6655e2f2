use std::sync::Arc;
use std::time::Duration;

use rubric_harness::context::HttpContextProvider;
use rubric_harness::evaluate::EvaluatorConfig;
use rubric_harness::export::{grades_to_csv, GradeRow};
use rubric_harness::extract::Score;
use rubric_harness::gateway::chat_api::ChatApiAdapter;
use rubric_harness::gateway::{ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway};
use rubric_harness::grading::{Grader, NO_SUBMISSION};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const JUDGMENT: &str = "Correctness:\n-Score: 3\n-Explanation: matches the reference\n\
Comprehensiveness:\n-Score: 2\n-Explanation: misses one case\n\
Readability:\n-Score: 2\n-Explanation: clear enough";

struct QaJudge;

impl Respond for QaJudge {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap_or_default();
        if user.contains("UNGRADABLE") {
            return ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "backend crashed" }
            }));
        }
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": JUDGMENT }, "finish_reason": "stop" }]
        }))
    }
}

async fn grader() -> (Grader, MockServer, MockServer) {
    let judge = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(QaJudge)
        .mount(&judge)
        .await;

    let retrieval = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "context": "Recursion is a function calling itself with a base case."
        })))
        .mount(&retrieval)
        .await;

    let adapter = ChatApiAdapter::with_config(judge.uri(), None, Duration::from_secs(5)).unwrap();
    let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ));
    let context = Arc::new(HttpContextProvider::new(retrieval.uri()).unwrap());
    let grader = Grader::new(gateway, context, EvaluatorConfig::default());
    (grader, judge, retrieval)
}

#[tokio::test]
async fn submission_total_is_sum_of_weighted_unit_grades() {
    let (grader, judge, _retrieval) = grader().await;
    let text = "Q1: What is recursion?\nA1: A function calling itself.\n\
                Q2: What stops it?\nA2: A base case.";

    let graded = grader.grade_submission(text).await;

    assert_eq!(graded.units.len(), 2);
    for unit in &graded.units {
        let grade = unit.grade.as_ref().unwrap();
        assert_eq!(grade.scores.get("Correctness"), Some(&Score::Value(3)));
        assert_eq!(grade.scores.get("Readability"), Some(&Score::Value(2)));
    }
    assert!((graded.total_score - 5.2).abs() < 1e-9);
    assert!(graded.feedback.starts_with("Q1: Correctness:"));
    assert!(graded.feedback.contains(" | Q2: Correctness:"));
    assert_eq!(judge.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failing_unit_contributes_zero_and_na_feedback() {
    let (grader, _judge, _retrieval) = grader().await;
    let text = "Q1: What is recursion?\nA1: A function calling itself.\n\
                Q2: What stops it?\nA2: UNGRADABLE";

    let graded = grader.grade_submission(text).await;

    assert_eq!(graded.units.len(), 2);
    assert!(graded.units[1].grade.is_none());
    assert!((graded.total_score - 2.6).abs() < 1e-9);
    let parts: Vec<&str> = graded.feedback.split(" | ").collect();
    assert_eq!(parts.len(), 2);
    assert!(parts[1].starts_with("Q2: N/A ("));
    assert!(parts[1].contains("backend crashed"));
}

#[tokio::test]
async fn unstructured_text_is_graded_as_one_unit() {
    let (grader, _judge, _retrieval) = grader().await;
    let graded = grader
        .grade_submission("Recursion is when a function calls itself until a base case.")
        .await;
    assert_eq!(graded.units.len(), 1);
    assert!(graded.units[0].unit.is_raw());
    assert!((graded.total_score - 2.6).abs() < 1e-9);
}

#[tokio::test]
async fn empty_submission_skips_the_backend() {
    let (grader, judge, _retrieval) = grader().await;
    let graded = grader.grade_submission("\n\n").await;
    assert_eq!(graded.total_score, 0.0);
    assert_eq!(graded.feedback, NO_SUBMISSION);
    assert!(judge.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn graded_submission_exports_to_gradebook_csv() {
    let (grader, _judge, _retrieval) = grader().await;
    let graded = grader
        .grade_submission("Q1: What is recursion?\nA1: A function calling itself.")
        .await;

    let dir = tempdir().unwrap();
    let csv_path = dir.path().join("grades.csv");
    let row = GradeRow::from_submission("Ada Lovelace", "1001", "ada@example.org", &graded);
    grades_to_csv(&[row], std::fs::File::create(&csv_path).unwrap()).unwrap();

    let raw = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = raw.split("\r\n");
    assert_eq!(
        lines.next().unwrap(),
        "Full Name,User ID,Email,Total Score,Feedback"
    );
    let rest: String = lines.collect::<Vec<_>>().join("\r\n");
    assert!(rest.starts_with("Ada Lovelace,1001,ada@example.org,2.60,\"Q1: Correctness:"));
}
