//! Build phase: normalize, embed and upsert a mailbox with a bounded pool of
//! concurrent batches.

pub mod progress;


use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::email::{Message, RawEmail};
use crate::embeddings::{Embedder, EmbeddingError};
use crate::index::{IndexError, UpsertOutcome, VectorIndex};
use crate::normalizer::{Normalized, NormalizerOptions, normalize_with};

pub use progress::{IndexProgress, ProgressSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerOptions {
    /// Emails per embedding call
    pub batch_size: usize,
    /// Batches in flight at once
    pub workers: usize,
    pub embed_timeout: Duration,
    pub normalizer: NormalizerOptions,
}

impl Default for IndexerOptions {
    #[inline]
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IndexerOptions {
    #[inline]
    fn from(config: &Config) -> Self {
        Self {
            batch_size: (config.embedding.batch_size as usize).max(1),
            workers: config.indexing.workers.max(1),
            embed_timeout: Duration::from_secs(config.indexing.embed_timeout_seconds.max(1)),
            normalizer: NormalizerOptions::from(&config.indexing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMessage {
    pub id: String,
    pub reason: String,
}

/// Aggregate result of one indexing run. `indexed + unchanged + skipped`
/// accounts for every distinct input email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingSummary {
    pub total: usize,
    /// Newly embedded and written
    pub indexed: usize,
    /// Already indexed with identical content
    pub unchanged: usize,
    /// Normalized with degradations (see the log for reasons)
    pub degraded: usize,
    pub skipped: Vec<SkippedMessage>,
}

impl IndexingSummary {
    #[inline]
    pub fn succeeded(&self) -> usize {
        self.indexed + self.unchanged
    }

    fn absorb(&mut self, other: Self) {
        self.indexed += other.indexed;
        self.unchanged += other.unchanged;
        self.degraded += other.degraded;
        self.skipped.extend(other.skipped);
    }

    fn skip(&mut self, progress: &IndexProgress, id: &str, reason: impl ToString) {
        progress.record_skipped();
        self.skipped.push(SkippedMessage {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}

pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    options: IndexerOptions,
}

impl Indexer {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, options: IndexerOptions) -> Self {
        Self {
            embedder,
            index,
            options,
        }
    }

    /// Index `emails`, embedding only those that are new or changed.
    ///
    /// Per-email failures are collected in the summary and never abort the
    /// run. Only a failure to persist the index is returned as an error.
    #[inline]
    pub async fn index_emails(
        &self,
        emails: Vec<RawEmail>,
        progress: &IndexProgress,
    ) -> Result<IndexingSummary, IndexError> {
        let emails = dedupe_by_id(emails);
        progress.set_total(emails.len());

        let mut summary = IndexingSummary {
            total: emails.len(),
            ..IndexingSummary::default()
        };

        info!(
            "Indexing {} emails in batches of {} with {} workers",
            emails.len(),
            self.options.batch_size,
            self.options.workers
        );

        let batches: Vec<Vec<RawEmail>> = emails
            .chunks(self.options.batch_size.max(1))
            .map(<[RawEmail]>::to_vec)
            .collect();

        let mut outcomes = stream::iter(batches)
            .map(|batch| self.process_batch(batch, progress))
            .buffer_unordered(self.options.workers.max(1));

        while let Some(outcome) = outcomes.next().await {
            summary.absorb(outcome);
        }

        let persisted = self.index.persist().await;
        progress.finish();
        persisted?;

        info!(
            "Indexing finished: {} indexed, {} unchanged, {} skipped, {} degraded",
            summary.indexed,
            summary.unchanged,
            summary.skipped.len(),
            summary.degraded
        );
        Ok(summary)
    }

    async fn process_batch(&self, batch: Vec<RawEmail>, progress: &IndexProgress) -> IndexingSummary {
        let mut outcome = IndexingSummary::default();
        let ids: Vec<String> = batch.iter().map(|raw| raw.id.clone()).collect();

        let options = self.options.normalizer.clone();
        let normalized = tokio::task::spawn_blocking(move || {
            batch
                .iter()
                .map(|raw| normalize_with(raw, &options))
                .collect::<Vec<Normalized>>()
        })
        .await;

        let normalized = match normalized {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("Normalization task failed for a batch of {}: {}", ids.len(), e);
                for id in &ids {
                    outcome.skip(progress, id, format!("normalization failed: {e}"));
                }
                return outcome;
            }
        };

        let mut pending: Vec<Message> = Vec::with_capacity(normalized.len());
        for Normalized { message, degraded } in normalized {
            if message.id.trim().is_empty() {
                outcome.skip(progress, &message.id, "email has no id");
                continue;
            }
            if degraded.is_some() {
                outcome.degraded += 1;
            }
            if !message.has_content() {
                outcome.skip(progress, &message.id, EmbeddingError::EmptyInput { index: 0 });
                continue;
            }
            if self.index.is_current(&message).await {
                outcome.unchanged += 1;
                progress.record_unchanged();
                continue;
            }
            pending.push(message);
        }

        if pending.is_empty() {
            return outcome;
        }

        let texts: Vec<String> = pending.iter().map(Message::embedding_text).collect();
        let vectors = self.embed_texts(&texts).await;

        for (message, vector) in pending.iter().zip(vectors) {
            let vector = match vector {
                Ok(vector) => vector,
                Err(e) => {
                    warn!("Skipping {}: {}", message.id, e);
                    outcome.skip(progress, &message.id, e);
                    continue;
                }
            };

            match self.index.upsert(message, vector).await {
                Ok(UpsertOutcome::Unchanged) => {
                    outcome.unchanged += 1;
                    progress.record_unchanged();
                }
                Ok(_) => {
                    outcome.indexed += 1;
                    progress.record_indexed();
                }
                Err(e) => {
                    warn!("Could not index {}: {}", message.id, e);
                    outcome.skip(progress, &message.id, e);
                }
            }
        }

        debug!(
            "Batch done: {} indexed, {} unchanged, {} skipped",
            outcome.indexed,
            outcome.unchanged,
            outcome.skipped.len()
        );
        outcome
    }

    /// One batched call; if it fails, one call per text so a single bad email
    /// cannot sink its neighbours.
    async fn embed_texts(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let timeout = self.options.embed_timeout;
        let batch = tokio::time::timeout(timeout, self.embedder.embed_batch(texts))
            .await
            .unwrap_or(Err(EmbeddingError::Timeout))
            .and_then(|vectors| {
                if vectors.len() == texts.len() {
                    Ok(vectors)
                } else {
                    Err(EmbeddingError::InvalidResponse(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        vectors.len()
                    )))
                }
            });

        match batch {
            Ok(vectors) => vectors.into_iter().map(Ok).collect(),
            Err(e) => {
                warn!(
                    "Batch embedding of {} emails failed ({}), retrying one at a time",
                    texts.len(),
                    e
                );
                let mut results = Vec::with_capacity(texts.len());
                for text in texts {
                    let result = tokio::time::timeout(timeout, self.embedder.embed(text))
                        .await
                        .unwrap_or(Err(EmbeddingError::Timeout));
                    results.push(result);
                }
                results
            }
        }
    }
}

/// Keep the last occurrence of each id, in the order those occurrences appear.
#[inline]
pub fn dedupe_by_id(emails: Vec<RawEmail>) -> Vec<RawEmail> {
    let mut seen = HashSet::with_capacity(emails.len());
    let mut unique: Vec<RawEmail> = emails
        .into_iter()
        .rev()
        .filter(|email| seen.insert(email.id.clone()))
        .collect();
    unique.reverse();
    unique
}
