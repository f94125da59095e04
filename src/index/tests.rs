use super::*;
use chrono::TimeZone;
use std::sync::Arc;
use tempfile::TempDir;

fn model(dimension: usize) -> ModelInfo {
    ModelInfo::new("test-model", dimension)
}

fn message(id: &str, text: &str, day: u32) -> Message {
    Message {
        id: id.to_string(),
        sender: "alice@example.com".to_string(),
        subject: format!("Subject {id}"),
        timestamp: Utc.with_ymd_and_hms(2024, 6, day, 8, 30, 0).single(),
        labels: vec!["INBOX".to_string()],
        raw_body: text.to_string(),
        normalized_text: text.to_string(),
    }
}

async fn open_index(dir: &TempDir, dimension: usize) -> VectorIndex {
    VectorIndex::open(dir.path().join("index.db"), model(dimension))
        .await
        .expect("should open index")
}

#[tokio::test]
async fn query_orders_by_similarity() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 3).await;

    index
        .upsert(&message("1", "first", 1), vec![1.0, 0.0, 0.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("2", "second", 1), vec![0.0, 1.0, 0.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("3", "third", 1), vec![0.7, 0.7, 0.0])
        .await
        .expect("should upsert");

    let result = index.query(&[1.0, 0.1, 0.0], 2).await.expect("should query");

    assert_eq!(result.ids(), vec!["1", "3"]);
    assert!(result.hits()[0].score > result.hits()[1].score);
    assert_eq!(result.hits()[0].normalized_text, "first");
    assert_eq!(result.hits()[0].metadata.labels, vec!["INBOX".to_string()]);

    index.close().await.expect("should close");
}

#[tokio::test]
async fn equal_scores_prefer_newer_email() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;

    index
        .upsert(&message("older", "same", 2), vec![1.0, 0.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("newer", "same", 9), vec![1.0, 0.0])
        .await
        .expect("should upsert");

    let result = index.query(&[1.0, 0.0], 5).await.expect("should query");
    assert_eq!(result.ids(), vec!["newer", "older"]);
}

#[tokio::test]
async fn zero_k_returns_nothing() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;
    index
        .upsert(&message("1", "text", 1), vec![1.0, 0.0])
        .await
        .expect("should upsert");

    let result = index.query(&[1.0, 0.0], 0).await.expect("should query");
    assert!(result.is_empty());
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;
    let msg = message("1", "text", 1);

    let first = index
        .upsert(&msg, vec![0.6, 0.8])
        .await
        .expect("should upsert");
    index.persist().await.expect("should persist");
    let before = index.query(&[0.6, 0.8], 3).await.expect("should query");

    let second = index
        .upsert(&msg, vec![0.6, 0.8])
        .await
        .expect("should upsert");
    let after = index.query(&[0.6, 0.8], 3).await.expect("should query");

    assert_eq!(first, UpsertOutcome::Inserted);
    assert_eq!(second, UpsertOutcome::Unchanged);
    assert_eq!(before, after);
    assert_eq!(index.stats().await.unsaved, 0);
}

#[tokio::test]
async fn changed_content_replaces_entry() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;

    index
        .upsert(&message("1", "original", 1), vec![1.0, 0.0])
        .await
        .expect("should upsert");
    let outcome = index
        .upsert(&message("1", "edited", 1), vec![0.0, 1.0])
        .await
        .expect("should upsert");

    assert_eq!(outcome, UpsertOutcome::Replaced);
    assert_eq!(index.len().await, 1);
    let entry = index.get("1").await.expect("entry should exist");
    assert_eq!(entry.normalized_text, "edited");
    assert_eq!(entry.vector, vec![0.0, 1.0]);
}

#[tokio::test]
async fn is_current_tracks_content() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;
    let original = message("1", "original", 1);
    index
        .upsert(&original, vec![1.0, 0.0])
        .await
        .expect("should upsert");

    assert!(index.contains("1").await);
    assert!(index.is_current(&original).await);
    assert!(!index.is_current(&message("1", "edited", 1)).await);
    assert!(!index.contains("2").await);
    assert!(!index.is_current(&message("2", "other", 1)).await);
}

#[tokio::test]
async fn wrong_dimensions_are_rejected() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 3).await;

    let upsert_err = index
        .upsert(&message("1", "text", 1), vec![1.0, 0.0])
        .await
        .expect_err("short vector should fail");
    assert!(matches!(
        upsert_err,
        IndexError::DimensionMismatch {
            expected: 3,
            actual: 2
        }
    ));

    let query_err = index
        .query(&[1.0, 0.0, 0.0, 0.0], 1)
        .await
        .expect_err("long query should fail");
    assert!(matches!(query_err, IndexError::DimensionMismatch { .. }));
    assert!(index.is_empty().await);
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = TempDir::new().expect("should create temp dir");
    {
        let index = open_index(&dir, 2).await;
        index
            .upsert(&message("1", "persisted", 4), vec![0.6, 0.8])
            .await
            .expect("should upsert");
        index.close().await.expect("should close");
    }

    let index = open_index(&dir, 2).await;
    assert_eq!(index.len().await, 1);

    let entry = index.get("1").await.expect("entry should be loaded");
    assert_eq!(entry.vector, vec![0.6, 0.8]);
    assert_eq!(entry.metadata.sender, "alice@example.com");
    assert_eq!(entry.metadata.labels, vec!["INBOX".to_string()]);
    assert_eq!(
        entry.metadata.timestamp,
        Utc.with_ymd_and_hms(2024, 6, 4, 8, 30, 0).single()
    );
    assert!(index.is_current(&message("1", "persisted", 4)).await);
}

#[tokio::test]
async fn persist_flushes_only_dirty_entries() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await;

    index
        .upsert(&message("1", "one", 1), vec![1.0, 0.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("2", "two", 1), vec![0.0, 1.0])
        .await
        .expect("should upsert");
    assert_eq!(index.stats().await.unsaved, 2);

    assert_eq!(index.persist().await.expect("should persist"), 2);
    assert_eq!(index.persist().await.expect("should persist"), 0);

    index
        .upsert(&message("2", "two changed", 1), vec![0.0, 1.0])
        .await
        .expect("should upsert");
    assert_eq!(index.persist().await.expect("should persist"), 1);
}

#[tokio::test]
async fn reopening_with_other_model_fails() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("index.db");
    VectorIndex::open(&path, ModelInfo::new("model-a", 4))
        .await
        .expect("should create index")
        .close()
        .await
        .expect("should close");

    let err = VectorIndex::open(&path, ModelInfo::new("model-b", 4))
        .await
        .expect_err("different model should be rejected");

    match err {
        IndexError::VersionMismatch { stored, active } => {
            assert_eq!(stored.model_id, "model-a");
            assert_eq!(active.model_id, "model-b");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reopening_with_other_dimension_fails() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("index.db");
    VectorIndex::open(&path, ModelInfo::new("model-a", 4))
        .await
        .expect("should create index")
        .close()
        .await
        .expect("should close");

    let result = VectorIndex::open(&path, ModelInfo::new("model-a", 8)).await;
    assert!(matches!(result, Err(IndexError::VersionMismatch { .. })));
}

#[tokio::test]
async fn model_version_is_pinned() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("index.db");
    VectorIndex::open(&path, ModelInfo::new("model-a", 4))
        .await
        .expect("should create index")
        .close()
        .await
        .expect("should close");

    // An unversioned index adopts the first version it sees
    VectorIndex::open(&path, ModelInfo::new("model-a", 4).with_version("sha256:1"))
        .await
        .expect("should accept first version")
        .close()
        .await
        .expect("should close");

    let result =
        VectorIndex::open(&path, ModelInfo::new("model-a", 4).with_version("sha256:2")).await;
    assert!(matches!(result, Err(IndexError::VersionMismatch { .. })));
}

#[tokio::test]
async fn missing_active_version_is_flagged() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("index.db");
    let index = VectorIndex::open(&path, ModelInfo::new("model-a", 4).with_version("sha256:1"))
        .await
        .expect("should create index");
    assert_eq!(index.unverified_version(), None);
    index.close().await.expect("should close");

    let index = VectorIndex::open(&path, ModelInfo::new("model-a", 4))
        .await
        .expect("should still open without a version");
    assert_eq!(index.unverified_version(), Some("sha256:1"));
    index.close().await.expect("should close");

    // The stored version is kept, so a later versioned open is still checked
    let result =
        VectorIndex::open(&path, ModelInfo::new("model-a", 4).with_version("sha256:2")).await;
    assert!(matches!(result, Err(IndexError::VersionMismatch { .. })));
}

#[derive(Debug)]
struct NothingFound;

impl NeighborSearch for NothingFound {
    fn name(&self) -> &'static str {
        "nothing"
    }

    fn search(&self, _: &HashMap<String, IndexEntry>, _: &[f32], _: usize) -> Vec<Candidate> {
        Vec::new()
    }
}

#[tokio::test]
async fn search_strategy_can_be_replaced() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, 2).await.with_search(Box::new(NothingFound));
    index
        .upsert(&message("1", "text", 1), vec![1.0, 0.0])
        .await
        .expect("should upsert");

    let result = index.query(&[1.0, 0.0], 3).await.expect("should query");
    assert!(result.is_empty());
    assert_eq!(index.stats().await.search, "nothing");
}

#[tokio::test]
async fn concurrent_queries_share_the_index() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = Arc::new(open_index(&dir, 2).await);
    for (i, vector) in [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]].into_iter().enumerate() {
        index
            .upsert(&message(&i.to_string(), "text", 1), vector.to_vec())
            .await
            .expect("should upsert");
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let index = Arc::clone(&index);
            tokio::spawn(async move { index.query(&[1.0, 0.0], 1).await })
        })
        .collect();

    for handle in handles {
        let result = handle
            .await
            .expect("should join")
            .expect("should query");
        assert_eq!(result.ids(), vec!["0"]);
    }
}

#[test]
fn retrieval_result_helpers() {
    let hit = |id: &str, score: f32| RetrievedEmail {
        id: id.to_string(),
        score,
        normalized_text: String::new(),
        metadata: EmailMetadata::default(),
    };
    let result = RetrievalResult::new(vec![hit("a", 0.9), hit("b", 0.4), hit("c", 0.2)]);

    assert_eq!(result.len(), 3);
    assert_eq!(result.best().map(|h| h.id.as_str()), Some("a"));

    let filtered = result.above_floor(0.4);
    assert_eq!(filtered.ids(), vec!["a", "b"]);
    assert!(RetrievalResult::empty().best().is_none());
}
