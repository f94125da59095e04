pub mod hashing;
pub mod ollama;


use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

pub use hashing::HashingEmbedder;
pub use ollama::OllamaEmbedder;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("input {index} is empty, nothing to embed")]
    EmptyInput { index: usize },
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding service returned HTTP {status}")]
    Service { status: u16 },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("expected a {expected}-dimensional embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Whether the same request might succeed if sent again
    #[inline]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Unavailable(_) => true,
            Self::Service { status } => *status == 429 || *status >= 500,
            Self::EmptyInput { .. } | Self::InvalidResponse(_) | Self::DimensionMismatch { .. } => {
                false
            }
        }
    }
}

/// Identity of the model that produced a set of vectors. Vectors from two
/// different identities must never be compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    /// Exact build of the model when the backend reports one (e.g. an Ollama digest)
    pub version: Option<String>,
    pub dimension: usize,
}

impl ModelInfo {
    #[inline]
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            version: None,
            dimension,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// An unknown version on either side is not treated as a conflict.
    #[inline]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.model_id == other.model_id
            && self.dimension == other.dimension
            && match (&self.version, &other.version) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for ModelInfo {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} dims", self.model_id, self.dimension)?;
        if let Some(version) = &self.version {
            write!(f, ", version {}", version)?;
        }
        write!(f, ")")
    }
}

/// Maps text to fixed-length vectors. Implementations hold no per-call state
/// and are shared behind an `Arc`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &ModelInfo;

    /// One vector per input, in input order. Fails for the whole batch if any
    /// input is blank.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }
}

#[inline]
pub fn ensure_non_empty(texts: &[String]) -> Result<(), EmbeddingError> {
    match texts.iter().position(|text| text.trim().is_empty()) {
        Some(index) => Err(EmbeddingError::EmptyInput { index }),
        None => Ok(()),
    }
}

/// Reject responses that would corrupt rankings: wrong count, wrong
/// dimension, non-finite values or all-zero vectors.
#[inline]
pub fn validate_embeddings(
    model: &ModelInfo,
    expected_count: usize,
    vectors: &[Vec<f32>],
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected_count,
            vectors.len()
        )));
    }

    for vector in vectors {
        if vector.len() != model.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: model.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "embedding contains non-finite values".to_string(),
            ));
        }
        if vector.iter().all(|v| *v == 0.0) {
            return Err(EmbeddingError::InvalidResponse(
                "embedding is a zero vector".to_string(),
            ));
        }
    }

    Ok(())
}

/// Build the embedder selected in configuration. For Ollama this checks the
/// server and pins the model digest so index compatibility can be verified.
#[inline]
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider {
        EmbeddingProvider::Hashing => {
            info!(
                "Using offline hashing embedder with {} dimensions",
                config.dimension
            );
            Ok(Arc::new(HashingEmbedder::new(config.dimension as usize)))
        }
        EmbeddingProvider::Ollama => {
            let client = OllamaEmbedder::new(config)?;
            let client = tokio::task::spawn_blocking(move || client.connect()).await??;
            info!("Using Ollama embedder {}", client.model());
            Ok(Arc::new(client))
        }
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero-norm input.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f32, 0.0f32, 0.0f32), |acc, (x, y)| {
        (
            x.mul_add(*y, acc.0),
            x.mul_add(*x, acc.1),
            y.mul_add(*y, acc.2),
        )
    });

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        dot / denominator
    }
}

/// Little-endian `f32` bytes, the on-disk vector format.
#[inline]
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[inline]
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    if blob.len() % 4 != 0 {
        return Err(EmbeddingError::InvalidResponse(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}
