//! The vector index: every indexed email's vector, text and metadata.
//!
//! Entries live in memory behind a reader-writer lock and are flushed to
//! SQLite on [`VectorIndex::persist`]. The embedding model identity is
//! recorded alongside the entries so an index built by one model can never be
//! queried with vectors from another.

pub mod search;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::database::models::{StoredEntry, StoredIndexMeta};
use crate::email::{EmailMetadata, Message};
use crate::embeddings::{ModelInfo, blob_to_vec, vec_to_blob};

pub use search::{Candidate, ExactSearch, NeighborSearch};

/// Upper bound for any single storage operation
const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WARN_THRESHOLD: usize = 100_000;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index was built with {stored} but the active embedder is {active}; rebuild the index")]
    VersionMismatch { stored: ModelInfo, active: ModelInfo },
    #[error("vector has {actual} dimensions, the index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("stored entry {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("index storage timed out")]
    Timeout,
    #[error("index storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub normalized_text: String,
    pub metadata: EmailMetadata,
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Same content and vector as the stored entry; nothing was written
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedEmail {
    pub id: String,
    pub score: f32,
    pub normalized_text: String,
    pub metadata: EmailMetadata,
}

/// Ranked hits, best first. Never longer than the `k` it was asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    hits: Vec<RetrievedEmail>,
}

impl RetrievalResult {
    /// Wrap hits that are already in rank order.
    #[inline]
    pub fn new(hits: Vec<RetrievedEmail>) -> Self {
        Self { hits }
    }

    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn hits(&self) -> &[RetrievedEmail] {
        &self.hits
    }

    #[inline]
    pub fn into_hits(self) -> Vec<RetrievedEmail> {
        self.hits
    }

    #[inline]
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.id.as_str()).collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    #[inline]
    pub fn best(&self) -> Option<&RetrievedEmail> {
        self.hits.first()
    }

    /// Drop every hit scoring below `floor`, keeping the order.
    #[inline]
    #[must_use]
    pub fn above_floor(mut self, floor: f32) -> Self {
        self.hits.retain(|hit| hit.score >= floor);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub path: PathBuf,
    pub model: ModelInfo,
    pub entries: usize,
    pub unsaved: usize,
    pub search: &'static str,
}

#[derive(Debug)]
struct IndexState {
    entries: HashMap<String, IndexEntry>,
    dirty: HashSet<String>,
    search: Box<dyn NeighborSearch>,
}

/// Handle to an open index. Share it as `Arc<VectorIndex>`; queries run
/// concurrently, writes take the lock exclusively.
#[derive(Debug)]
pub struct VectorIndex {
    database: Database,
    model: ModelInfo,
    path: PathBuf,
    warn_threshold: usize,
    /// Stored model version the active embedder could not confirm
    unverified_version: Option<String>,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Open or create the index at `path` for vectors produced by `model`.
    ///
    /// An existing index built with a different model fails with
    /// [`IndexError::VersionMismatch`] before any entry is loaded.
    #[inline]
    pub async fn open(path: impl AsRef<Path>, model: ModelInfo) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::Storage(anyhow::Error::new(e).context(format!(
                    "Failed to create index directory: {}",
                    parent.display()
                )))
            })?;
        }

        let database = with_storage_timeout(Database::new(&path)).await?;
        let mut unverified_version = None;

        match with_storage_timeout(database.read_meta()).await? {
            Some(stored) => {
                let stored_model = ModelInfo {
                    model_id: stored.model_id.clone(),
                    version: stored.model_version.clone(),
                    dimension: stored.dimension,
                };
                if !stored_model.is_compatible_with(&model) {
                    database.close().await;
                    return Err(IndexError::VersionMismatch {
                        stored: stored_model,
                        active: model,
                    });
                }
                if let (Some(stored_version), None) = (&stored_model.version, &model.version) {
                    warn!(
                        "Index {} was built with {} version {} but the active embedder reports no version; \
                         vectors from a different build would go undetected",
                        path.display(),
                        stored_model.model_id,
                        stored_version
                    );
                    unverified_version = Some(stored_version.clone());
                }
                if stored_model.version.is_none() && model.version.is_some() {
                    debug!("Recording model version {:?} for index", model.version);
                    let meta = StoredIndexMeta {
                        model_version: model.version.clone(),
                        ..stored
                    };
                    with_storage_timeout(database.write_meta(&meta)).await?;
                }
            }
            None => {
                debug!("Initialising new index at {} for {}", path.display(), model);
                let meta = StoredIndexMeta {
                    model_id: model.model_id.clone(),
                    model_version: model.version.clone(),
                    dimension: model.dimension,
                    created_at: Some(Utc::now()),
                };
                with_storage_timeout(database.write_meta(&meta)).await?;
            }
        }

        let stored_entries = with_storage_timeout(database.load_entries()).await?;
        let mut entries = HashMap::with_capacity(stored_entries.len());
        for stored in stored_entries {
            let entry = entry_from_stored(stored, model.dimension)?;
            entries.insert(entry.id.clone(), entry);
        }

        info!(
            "Opened index {} with {} entries ({})",
            path.display(),
            entries.len(),
            model
        );

        Ok(Self {
            database,
            model,
            path,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            unverified_version,
            state: RwLock::new(IndexState {
                entries,
                dirty: HashSet::new(),
                search: Box::new(ExactSearch),
            }),
        })
    }

    /// Replace the neighbour search strategy.
    #[inline]
    #[must_use]
    pub fn with_search(mut self, search: Box<dyn NeighborSearch>) -> Self {
        self.state.get_mut().search = search;
        self
    }

    /// Entry count above which exact search logs a warning.
    #[inline]
    #[must_use]
    pub fn with_warn_threshold(mut self, threshold: usize) -> Self {
        self.warn_threshold = threshold;
        self
    }

    #[inline]
    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded model version, when the active embedder reported none
    /// and the version check could not run.
    #[inline]
    pub fn unverified_version(&self) -> Option<&str> {
        self.unverified_version.as_deref()
    }

    #[inline]
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    #[inline]
    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    /// Whether `message` is indexed with exactly its current content.
    #[inline]
    pub async fn is_current(&self, message: &Message) -> bool {
        let hash = message.content_hash();
        self.state
            .read()
            .await
            .entries
            .get(&message.id)
            .is_some_and(|entry| entry.content_hash == hash)
    }

    #[inline]
    pub async fn get(&self, id: &str) -> Option<IndexEntry> {
        self.state.read().await.entries.get(id).cloned()
    }

    #[inline]
    pub async fn upsert(
        &self,
        message: &Message,
        vector: Vec<f32>,
    ) -> Result<UpsertOutcome, IndexError> {
        self.check_dimension(vector.len())?;
        let content_hash = message.content_hash();

        let mut state = self.state.write().await;
        let outcome = match state.entries.get(&message.id) {
            Some(existing) if existing.content_hash == content_hash && existing.vector == vector => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        };

        let entry = IndexEntry {
            id: message.id.clone(),
            vector,
            normalized_text: message.normalized_text.clone(),
            metadata: message.metadata(),
            content_hash,
            indexed_at: Utc::now(),
        };
        state.search.on_upsert(&entry);
        state.entries.insert(entry.id.clone(), entry);
        state.dirty.insert(message.id.clone());

        if outcome == UpsertOutcome::Inserted && state.entries.len() == self.warn_threshold + 1 {
            warn!(
                "Index holds more than {} entries; {} search may become slow",
                self.warn_threshold,
                state.search.name()
            );
        }

        debug!("Upserted {} ({:?})", message.id, outcome);
        Ok(outcome)
    }

    /// Up to `k` entries most similar to `vector`, best first. Equal scores
    /// rank the newer email first.
    #[inline]
    pub async fn query(&self, vector: &[f32], k: usize) -> Result<RetrievalResult, IndexError> {
        self.check_dimension(vector.len())?;
        if k == 0 {
            return Ok(RetrievalResult::empty());
        }

        let state = self.state.read().await;
        let mut candidates = state.search.search(&state.entries, vector, k);
        candidates.sort_by(|a, b| search::rank(a, b, &state.entries));
        candidates.truncate(k);

        let hits = candidates
            .into_iter()
            .filter_map(|candidate| {
                state.entries.get(&candidate.id).map(|entry| RetrievedEmail {
                    id: entry.id.clone(),
                    score: candidate.score,
                    normalized_text: entry.normalized_text.clone(),
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();

        Ok(RetrievalResult::new(hits))
    }

    /// Flush entries written since the last flush in one transaction.
    /// Returns how many were written.
    #[inline]
    pub async fn persist(&self) -> Result<usize, IndexError> {
        let mut state = self.state.write().await;
        if state.dirty.is_empty() {
            return Ok(0);
        }

        let pending = state
            .dirty
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(entry_to_stored)
            .collect::<Result<Vec<_>, _>>()?;

        let written = with_storage_timeout(self.database.save_entries(&pending)).await?;
        state.dirty.clear();

        info!("Persisted {} entries to {}", written, self.path.display());
        Ok(written)
    }

    /// Persist and release the storage.
    #[inline]
    pub async fn close(self) -> Result<(), IndexError> {
        self.persist().await?;
        self.database.close().await;
        debug!("Closed index {}", self.path.display());
        Ok(())
    }

    #[inline]
    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        IndexStats {
            path: self.path.clone(),
            model: self.model.clone(),
            entries: state.entries.len(),
            unsaved: state.dirty.len(),
            search: state.search.name(),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        if actual == self.model.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                expected: self.model.dimension,
                actual,
            })
        }
    }
}

impl Drop for VectorIndex {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_read() {
            if !state.dirty.is_empty() {
                warn!(
                    "Index {} dropped with {} unsaved entries; call persist() or close()",
                    self.path.display(),
                    state.dirty.len()
                );
            }
        }
    }
}

async fn with_storage_timeout<T, F>(operation: F) -> Result<T, IndexError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(STORAGE_TIMEOUT, operation)
        .await
        .map_err(|_| IndexError::Timeout)?
        .map_err(IndexError::Storage)
}

fn entry_to_stored(entry: &IndexEntry) -> Result<StoredEntry, IndexError> {
    let labels =
        serde_json::to_string(&entry.metadata.labels).map_err(|e| IndexError::Corrupt {
            id: entry.id.clone(),
            reason: format!("labels could not be encoded: {e}"),
        })?;

    Ok(StoredEntry {
        id: entry.id.clone(),
        sender: entry.metadata.sender.clone(),
        subject: entry.metadata.subject.clone(),
        timestamp: entry.metadata.timestamp,
        labels,
        normalized_text: entry.normalized_text.clone(),
        content_hash: entry.content_hash.clone(),
        vector: vec_to_blob(&entry.vector),
        indexed_at: entry.indexed_at,
    })
}

fn entry_from_stored(stored: StoredEntry, dimension: usize) -> Result<IndexEntry, IndexError> {
    let vector = blob_to_vec(&stored.vector).map_err(|e| IndexError::Corrupt {
        id: stored.id.clone(),
        reason: e.to_string(),
    })?;
    if vector.len() != dimension {
        return Err(IndexError::Corrupt {
            id: stored.id,
            reason: format!("vector has {} dimensions, expected {}", vector.len(), dimension),
        });
    }

    let labels = serde_json::from_str(&stored.labels).unwrap_or_else(|e| {
        warn!("Ignoring unreadable labels on {}: {}", stored.id, e);
        Vec::new()
    });

    Ok(IndexEntry {
        metadata: EmailMetadata {
            sender: stored.sender,
            subject: stored.subject,
            timestamp: stored.timestamp,
            labels,
        },
        id: stored.id,
        vector,
        normalized_text: stored.normalized_text,
        content_hash: stored.content_hash,
        indexed_at: stored.indexed_at,
    })
}
