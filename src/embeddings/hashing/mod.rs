//! Offline lexical embedder based on signed feature hashing.
//!
//! No model server is needed, so it serves air-gapped setups, tests and
//! benchmarks. Texts sharing vocabulary land close together; synonyms do not.


use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;

use super::{Embedder, EmbeddingError, ModelInfo, ensure_non_empty};

pub const HASHING_MODEL_ID: &str = "hashing-v1";

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "am", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by",
        "can", "could", "did", "do", "does", "for", "from", "fw", "fwd", "had", "has", "have",
        "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no",
        "not", "of", "on", "or", "our", "please", "re", "she", "so", "subject", "that", "the",
        "their", "them", "there", "they", "this", "to", "us", "was", "we", "were", "what", "when",
        "where", "which", "who", "why", "will", "with", "would", "you", "your",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    info: ModelInfo,
}

impl HashingEmbedder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            info: ModelInfo::new(HASHING_MODEL_ID, dimension.max(1)),
        }
    }

    /// Embed a single text synchronously.
    #[inline]
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput { index: 0 });
        }

        let dimension = self.info.dimension;
        let mut vector = vec![0.0f32; dimension];
        for token in &tokens {
            let (bucket, sign) = feature_slot(token, dimension);
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            // Every token cancelled out; fall back to unsigned counts.
            for token in &tokens {
                let (bucket, _) = feature_slot(token, dimension);
                vector[bucket] += 1.0;
            }
            return Ok(normalize(vector));
        }

        Ok(vector.into_iter().map(|v| v / norm).collect())
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        ensure_non_empty(texts)?;
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                self.embed_text(text).map_err(|e| match e {
                    EmbeddingError::EmptyInput { .. } => EmbeddingError::EmptyInput { index },
                    other => other,
                })
            })
            .collect()
    }
}

/// Lowercased alphanumeric words with stop-words removed and a naive plural
/// fold. Falls back to the stop-words themselves when nothing else is left.
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();

    let content: Vec<String> = words
        .iter()
        .filter(|word| !STOP_WORDS.contains(word.as_str()))
        .map(|word| fold_plural(word))
        .collect();

    if content.is_empty() { words } else { content }
}

fn fold_plural(word: &str) -> String {
    if word.chars().count() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word.strip_suffix('s').unwrap_or(word).to_string()
    } else {
        word.to_string()
    }
}

fn feature_slot(token: &str, dimension: usize) -> (usize, f32) {
    let digest = Sha256::digest(token.as_bytes());
    let mut bucket_bytes = [0u8; 8];
    bucket_bytes.copy_from_slice(&digest[..8]);
    let bucket = (u64::from_le_bytes(bucket_bytes) % dimension as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}

fn normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        vector
    } else {
        vector.into_iter().map(|v| v / norm).collect()
    }
}
