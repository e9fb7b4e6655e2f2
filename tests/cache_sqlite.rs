use rubric_harness::cache::{CachedJudgment, JudgmentCacheKey, SqliteJudgmentCache};
use rubric_harness::rubric::Dimension;
use rubric_harness::JudgmentCache;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    dimension: String,
    hit_count: i64,
    judgment: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

fn key(subject: &str) -> JudgmentCacheKey {
    let dim = Dimension::new("Clarity", "Explains ideas clearly.", 1, 5).unwrap();
    JudgmentCacheKey::new(
        "llama3.1",
        "instructor_v1",
        "template_hash",
        &dim,
        subject,
        None,
        "transcript text",
    )
}

fn judgment() -> CachedJudgment {
    CachedJudgment {
        text: "Clarity:\n-Score: 4\n-Explanation: clear".to_string(),
        input_tokens: Some(10),
        output_tokens: Some(5),
    }
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let key = key("Dr. Rivera");
    assert!(cache.get(&key).await.unwrap().is_none());

    cache.put(&key, &judgment()).await.unwrap();

    let hit1 = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit1, judgment());

    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let row = rows
        .into_iter()
        .find(|r| r.key_hash == key.key_hash)
        .unwrap();

    assert_eq!(row.hit_count, 2);
    assert_eq!(row.dimension, "Clarity");
    assert_eq!(row.judgment, judgment().text);
    assert_eq!(row.input_tokens, Some(10));
    assert_eq!(row.output_tokens, Some(5));
}

#[tokio::test]
async fn sqlite_cache_put_overwrites_existing_judgment() {
    let dir = tempdir().unwrap();
    let cache = SqliteJudgmentCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = key("Dr. Rivera");

    cache.put(&key, &judgment()).await.unwrap();
    let updated = CachedJudgment {
        text: "Clarity:\n-Score: 5".to_string(),
        input_tokens: None,
        output_tokens: None,
    };
    cache.put(&key, &updated).await.unwrap();

    assert_eq!(cache.get(&key).await.unwrap().unwrap(), updated);
}

#[tokio::test]
async fn sqlite_cache_prune_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let old_key = key("Dr. Rivera");
    let new_key = key("Prof. Okafor");

    cache.put(&old_key, &judgment()).await.unwrap();
    cache.put(&new_key, &judgment()).await.unwrap();

    // Make the "old" row deterministically older so prune ordering is stable.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE judgment_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![old_key.key_hash],
    )
    .unwrap();

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.deleted, 1);

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, new_key.key_hash);
}

#[tokio::test]
async fn sqlite_cache_prune_by_age_drops_stale_rows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let stale = key("Dr. Rivera");
    cache.put(&stale, &judgment()).await.unwrap();
    cache.put(&key("Prof. Okafor"), &judgment()).await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE judgment_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![stale.key_hash],
    )
    .unwrap();

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(cache.get(&stale).await.unwrap().is_none());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
