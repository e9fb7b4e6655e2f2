use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rubric_harness::cache::{JudgmentCache, SqliteJudgmentCache};
use rubric_harness::context::{ContextProvider, HttpContextProvider, StaticContextProvider};
use rubric_harness::evaluate::{
    EvaluationRequest, Evaluator, EvaluatorConfig, FailureKind, Stage, CANCELLED,
    CONTEXT_UNAVAILABLE,
};
use rubric_harness::extract::Score;
use rubric_harness::gateway::chat_api::ChatApiAdapter;
use rubric_harness::gateway::{ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway};
use rubric_harness::rubric::{Dimension, RubricCatalog};
use rubric_harness::trace::{JsonlTraceSink, TraceSink};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const NAMES: [&str; 5] = ["Clarity", "Pacing", "Engagement", "Structure", "Examples"];
const FAILING: &str = "Pacing";

fn catalog() -> RubricCatalog {
    RubricCatalog::new(
        NAMES
            .iter()
            .map(|n| Dimension::new(*n, format!("How well the lecture does on {n}."), 0, 3).unwrap())
            .collect(),
    )
    .unwrap()
}

/// Pulls the criterion out of the rendered user prompt and answers for it.
/// The failing dimension gets a non-retryable 400.
struct JudgeResponder;

fn criterion_of(body: &serde_json::Value) -> Option<String> {
    let user = body["messages"][1]["content"].as_str()?;
    let start = user.find("on the criterion \"")? + "on the criterion \"".len();
    let end = user[start..].find('"')? + start;
    Some(user[start..end].to_string())
}

impl Respond for JudgeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let criterion = criterion_of(&body).unwrap_or_default();
        if criterion == FAILING {
            return ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "context length exceeded" }
            }));
        }
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": format!("{criterion}:\n-Score: 2\n-Explanation: steady delivery")
                },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 20 }
        }))
    }
}

async fn judge_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(JudgeResponder)
        .mount(&server)
        .await;
    server
}

fn gateway(server: &MockServer) -> Arc<dyn ChatGateway> {
    let adapter = ChatApiAdapter::with_config(server.uri(), None, Duration::from_secs(5)).unwrap();
    Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ))
}

fn static_context() -> Arc<dyn ContextProvider> {
    Arc::new(StaticContextProvider::new(vec![
        "Dr. Rivera: today we cover recursion.".to_string(),
    ]))
}

#[tokio::test]
async fn one_failing_dimension_is_isolated_as_na() {
    let server = judge_server().await;
    let evaluator = Evaluator::new(gateway(&server), static_context(), EvaluatorConfig::default());

    let report = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();

    let score_keys: Vec<&str> = report.scores.keys().collect();
    let text_keys: Vec<&str> = report.per_dimension.keys().collect();
    assert_eq!(score_keys, NAMES.to_vec());
    assert_eq!(text_keys, NAMES.to_vec());

    for name in NAMES {
        let expected = if name == FAILING {
            Score::NotApplicable
        } else {
            Score::Value(2)
        };
        assert_eq!(report.scores.get(name), Some(&expected), "{name}");
    }

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures, vec![(FAILING, FailureKind::GenerationFailure)]);
    assert!(report.per_dimension.get(FAILING).unwrap().contains("context length exceeded"));

    let overall = report.overall.as_ref().unwrap();
    assert_eq!(overall.value, Some(2.0));
    assert_eq!(overall.explanation, "Overall: 2.00 (4 of 5 dimensions scored)");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 5);
}

#[tokio::test]
async fn report_json_has_document_and_scores() {
    let server = judge_server().await;
    let evaluator = Evaluator::new(gateway(&server), static_context(), EvaluatorConfig::default());

    let report = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["SCORES"]["Clarity"], 2);
    assert_eq!(json["SCORES"][FAILING], "N/A");
    assert!(json["DOCUMENT"]["Clarity"]
        .as_str()
        .unwrap()
        .contains("steady delivery"));
    assert_eq!(json["OVERALL"]["score"], 2.0);
}

#[tokio::test]
async fn unreachable_context_service_marks_every_dimension_unavailable() {
    let judge = judge_server().await;
    let retrieval = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&retrieval)
        .await;

    let context = Arc::new(HttpContextProvider::new(retrieval.uri()).unwrap());
    let evaluator = Evaluator::new(gateway(&judge), context, EvaluatorConfig::default());

    let report = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();

    assert_eq!(report.scores.len(), NAMES.len());
    for (name, text, score) in report.rows() {
        assert_eq!(score, Score::NotApplicable, "{name}");
        assert_eq!(text, CONTEXT_UNAVAILABLE);
        assert_eq!(report.outcomes.get(name).unwrap().stage, Stage::Retrieving);
    }
    assert_eq!(report.overall.as_ref().unwrap().value, None);
    assert!(judge.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn comparison_query_mentions_secondary_name() {
    let judge = judge_server().await;
    let retrieval = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .and(body_string_contains("in comparison to Backend Engineer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "context": ["Resume: five years of Rust.", "Job: backend engineer."]
        })))
        .expect(5)
        .mount(&retrieval)
        .await;

    let context = Arc::new(HttpContextProvider::new(retrieval.uri()).unwrap());
    let evaluator = Evaluator::new(gateway(&judge), context, EvaluatorConfig::default());

    // The document template asks about the criterion with the same phrasing,
    // so the judge mock answers it too.
    let report = evaluator
        .evaluate(EvaluationRequest::new("Jane Doe", catalog()).with_secondary("Backend Engineer"))
        .await
        .unwrap();

    assert_eq!(report.secondary_name.as_deref(), Some("Backend Engineer"));
    assert_eq!(report.scores.get("Clarity"), Some(&Score::Value(2)));
}

#[tokio::test]
async fn cancelled_before_start_skips_every_dimension() {
    let server = judge_server().await;
    let evaluator = Evaluator::new(gateway(&server), static_context(), EvaluatorConfig::default());
    let cancel = AtomicBool::new(true);

    let report = evaluator
        .evaluate_with_cancel(EvaluationRequest::new("Dr. Rivera", catalog()), &cancel)
        .await
        .unwrap();

    assert_eq!(report.scores.len(), NAMES.len());
    assert!(report.per_dimension.values().all(|t| t == CANCELLED));
    assert!(report
        .failures()
        .all(|(_, kind)| kind == FailureKind::Cancelled));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_generation_times_out_per_dimension() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({
                    "choices": [{ "message": { "content": "Clarity:\n-Score: 3" }, "finish_reason": "stop" }]
                })),
        )
        .mount(&server)
        .await;

    let config = EvaluatorConfig::default().with_dimension_timeout(Duration::from_millis(200));
    let evaluator = Evaluator::new(gateway(&server), static_context(), config);
    let single = RubricCatalog::single(Dimension::new("Clarity", "", 0, 3).unwrap());

    let report = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", single))
        .await
        .unwrap();

    assert_eq!(report.scores.get("Clarity"), Some(&Score::NotApplicable));
    let outcome = report.outcomes.get("Clarity").unwrap();
    assert_eq!(outcome.failure, Some(FailureKind::GenerationFailure));
    assert_eq!(outcome.stage, Stage::Generating);
}

#[tokio::test]
async fn stalled_context_service_times_out_as_retrieval_failure() {
    let judge = judge_server().await;
    let retrieval = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({ "context": "late passage" })),
        )
        .mount(&retrieval)
        .await;

    let context = Arc::new(HttpContextProvider::new(retrieval.uri()).unwrap());
    let config = EvaluatorConfig::default().with_dimension_timeout(Duration::from_millis(200));
    let evaluator = Evaluator::new(gateway(&judge), context, config);
    let single = RubricCatalog::single(Dimension::new("Clarity", "", 0, 3).unwrap());

    let report = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", single))
        .await
        .unwrap();

    assert_eq!(report.scores.get("Clarity"), Some(&Score::NotApplicable));
    let outcome = report.outcomes.get("Clarity").unwrap();
    assert_eq!(outcome.stage, Stage::Retrieving);
    assert_eq!(outcome.failure, Some(FailureKind::RetrievalUnavailable));
    assert!(report
        .per_dimension
        .get("Clarity")
        .unwrap()
        .starts_with("context retrieval timed out"));
    assert!(judge.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn cached_judgments_skip_the_backend() {
    let server = judge_server().await;
    let dir = tempdir().unwrap();
    let cache = SqliteJudgmentCache::new(dir.path().join("cache.sqlite")).unwrap();

    let evaluator = Evaluator::new(gateway(&server), static_context(), EvaluatorConfig::default())
        .with_cache(Arc::new(cache) as Arc<dyn JudgmentCache>);

    let first = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();
    let second = evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();

    assert_eq!(first.scores, second.scores);
    for name in NAMES {
        let cached = second.outcomes.get(name).unwrap().cached;
        assert_eq!(cached, name != FAILING, "{name}");
    }

    // Five live calls, then only the failed dimension again.
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn trace_records_one_line_per_dimension() {
    let server = judge_server().await;
    let dir = tempdir().unwrap();
    let trace_path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::new(&trace_path).unwrap();

    let evaluator = Evaluator::new(gateway(&server), static_context(), EvaluatorConfig::default())
        .with_trace(Arc::new(sink) as Arc<dyn TraceSink>);
    evaluator
        .evaluate(EvaluationRequest::new("Dr. Rivera", catalog()))
        .await
        .unwrap();
    drop(evaluator);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&trace_path).unwrap();
    let rows: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 5);

    let failed = rows.iter().find(|r| r["dimension"] == FAILING).unwrap();
    assert_eq!(failed["failure"], "generation_failure");
    assert_eq!(failed["score"], "N/A");
    assert_eq!(failed["stage"], "generating");

    let ok = rows.iter().find(|r| r["dimension"] == "Clarity").unwrap();
    assert_eq!(ok["score"], 2);
    assert_eq!(ok["stage"], "done");
    assert_eq!(ok["input_tokens"], 100);
    assert_eq!(ok["prompt_template_slug"], "instructor_v1");
}
