use super::*;
use crate::email::Message;
use crate::embeddings::{HashingEmbedder, ModelInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use tempfile::TempDir;

/// Looks vectors up by exact text; anything unknown is "unavailable".
struct LookupEmbedder {
    info: ModelInfo,
    vectors: HashMap<String, Vec<f32>>,
}

#[async_trait]
impl Embedder for LookupEmbedder {
    fn model(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        crate::embeddings::ensure_non_empty(texts)?;
        texts
            .iter()
            .map(|text| {
                self.vectors
                    .get(text)
                    .cloned()
                    .ok_or_else(|| EmbeddingError::Unavailable(format!("no vector for {text}")))
            })
            .collect()
    }
}

fn message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        sender: "bob@example.com".to_string(),
        subject: format!("Subject {id}"),
        timestamp: None,
        labels: Vec::new(),
        raw_body: String::new(),
        normalized_text: format!("body {id}"),
    }
}

async fn fixture(dir: &TempDir) -> (Arc<dyn Embedder>, Arc<VectorIndex>) {
    let info = ModelInfo::new("lookup", 2);
    let vectors = HashMap::from([
        ("north".to_string(), vec![0.0, 1.0]),
        ("east".to_string(), vec![1.0, 0.0]),
        ("north-east".to_string(), vec![0.7, 0.7]),
    ]);
    let embedder: Arc<dyn Embedder> = Arc::new(LookupEmbedder {
        info: info.clone(),
        vectors,
    });

    let index = VectorIndex::open(dir.path().join("index.db"), info)
        .await
        .expect("should open index");
    index
        .upsert(&message("n"), vec![0.0, 1.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("e"), vec![1.0, 0.0])
        .await
        .expect("should upsert");
    index
        .upsert(&message("ne"), vec![0.6, 0.8])
        .await
        .expect("should upsert");

    (embedder, Arc::new(index))
}

#[tokio::test]
async fn floor_excludes_weak_matches() {
    let dir = TempDir::new().expect("should create temp dir");
    let (embedder, index) = fixture(&dir).await;
    let retriever = Retriever::new(embedder, index, 0.5);

    let result = retriever.retrieve("north", 3).await.expect("should retrieve");

    // "e" is orthogonal to the query and scores 0.0
    assert_eq!(result.ids(), vec!["n", "ne"]);
    assert!(result.hits().iter().all(|hit| hit.score >= 0.5));
    assert!(result.hits().windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn results_never_exceed_k() {
    let dir = TempDir::new().expect("should create temp dir");
    let (embedder, index) = fixture(&dir).await;
    let retriever = Retriever::new(embedder, index, -1.0);

    let result = retriever.retrieve("north-east", 2).await.expect("should retrieve");
    assert_eq!(result.len(), 2);
    assert_eq!(result.best().map(|h| h.id.as_str()), Some("ne"));
}

#[tokio::test]
async fn nothing_above_floor_is_empty_not_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let (embedder, index) = fixture(&dir).await;
    let retriever = Retriever::new(embedder, index, 0.995);

    let result = retriever.retrieve("north-east", 3).await.expect("should retrieve");
    assert!(result.is_empty());
}

#[tokio::test]
async fn zero_k_skips_embedding() {
    let dir = TempDir::new().expect("should create temp dir");
    let (embedder, index) = fixture(&dir).await;
    let retriever = Retriever::new(embedder, index, 0.0);

    // Unknown text would fail if it reached the embedder
    let result = retriever.retrieve("unknown", 0).await.expect("should retrieve");
    assert!(result.is_empty());
}

#[tokio::test]
async fn blank_question_is_an_embedding_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let (embedder, index) = fixture(&dir).await;
    let retriever = Retriever::new(embedder, index, 0.0);

    let err = retriever.retrieve("   ", 3).await.expect_err("should fail");
    assert!(matches!(
        err,
        RetrievalError::Embedding(EmbeddingError::EmptyInput { .. })
    ));
}

#[tokio::test]
async fn mismatched_embedder_is_an_index_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let (_, index) = fixture(&dir).await;
    let retriever = Retriever::new(Arc::new(HashingEmbedder::new(16)), index, 0.0);

    let err = retriever
        .retrieve("anything at all", 3)
        .await
        .expect_err("should fail");
    assert!(matches!(
        err,
        RetrievalError::Index(IndexError::DimensionMismatch { .. })
    ));
}
