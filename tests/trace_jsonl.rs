use rubric_harness::extract::{Score, ScoreStrategy};
use rubric_harness::{DimensionTrace, JsonlTraceSink, Stage, TraceSink};
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    dimension_index: usize,
    dimension: String,
    score: serde_json::Value,
    strategy: Option<String>,
}

fn make_trace(dimension_index: usize) -> DimensionTrace {
    DimensionTrace {
        timestamp_ms: 0,
        request_id: Uuid::nil(),
        subject_name: "Dr. Rivera".to_string(),
        dimension: "Clarity".to_string(),
        dimension_index,
        prompt_template_slug: "instructor_v1".to_string(),
        template_hash: "template_hash".to_string(),
        model: "llama3.1".to_string(),
        stage: Stage::Done,
        failure: None,
        score: Score::Value(4),
        strategy: Some(ScoreStrategy::LiteralScoreLabel),
        cached: true,
        latency_ms: 0,
        input_tokens: 0,
        output_tokens: 0,
        error: None,
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(1)).unwrap();
    sink.record(make_trace(2)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: TraceRow = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.dimension_index, 1);
    assert_eq!(first.dimension, "Clarity");
    assert_eq!(first.score, 4);
    assert_eq!(first.strategy.as_deref(), Some("literal_score_label"));
}
