#[cfg(test)]
mod tests;

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::embeddings::{Embedder, EmbeddingError};
use crate::index::{IndexError, VectorIndex};

pub use crate::index::{RetrievalResult, RetrievedEmail};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("could not embed the question: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("could not search the index: {0}")]
    Index(#[from] IndexError),
}

/// Turns a question into the most relevant indexed emails. Holds no state of
/// its own between calls.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    similarity_floor: f32,
}

impl Retriever {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, similarity_floor: f32) -> Self {
        Self {
            embedder,
            index,
            similarity_floor,
        }
    }

    #[inline]
    pub fn similarity_floor(&self) -> f32 {
        self.similarity_floor
    }

    /// At most `k` emails, best first, every one scoring at least the
    /// similarity floor. An empty result means nothing was relevant enough.
    #[inline]
    pub async fn retrieve(&self, question: &str, k: usize) -> Result<RetrievalResult, RetrievalError> {
        if k == 0 {
            return Ok(RetrievalResult::empty());
        }

        let query = self.embedder.embed(question).await?;
        let nearest = self.index.query(&query, k).await?;
        let considered = nearest.len();
        let result = nearest.above_floor(self.similarity_floor);

        debug!(
            "Retrieved {} of {} nearest emails above floor {:.2}",
            result.len(),
            considered,
            self.similarity_floor
        );
        Ok(result)
    }
}
