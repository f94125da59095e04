use thiserror::Error;

pub type Result<T> = std::result::Result<T, InboxError>;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] embeddings::EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] index::IndexError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] retriever::RetrievalError),

    #[error("Generation error: {0}")]
    Generation(Box<qa::GenerationError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<qa::GenerationError> for InboxError {
    #[inline]
    fn from(err: qa::GenerationError) -> Self {
        Self::Generation(Box::new(err))
    }
}

pub mod commands;
pub mod config;
pub mod database;
pub mod email;
pub mod embeddings;
pub mod index;
pub mod indexer;
pub mod normalizer;
pub mod qa;
pub mod retriever;
