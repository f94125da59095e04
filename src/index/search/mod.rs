//! Nearest-neighbour strategies over the in-memory entry set.


use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use super::IndexEntry;
use crate::embeddings::cosine_similarity;

/// A scored candidate produced by a search strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub score: f32,
}

/// Finds entries similar to a query vector.
///
/// Strategies may return more than `k` candidates; the index applies the final
/// ordering and cut. Write hooks let an approximate structure track the entry
/// set without rescanning it.
pub trait NeighborSearch: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn on_upsert(&mut self, _entry: &IndexEntry) {}

    fn search(
        &self,
        entries: &HashMap<String, IndexEntry>,
        query: &[f32],
        k: usize,
    ) -> Vec<Candidate>;
}

/// Brute-force cosine similarity over every entry. Exact, and fast enough for
/// mailboxes in the tens of thousands.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSearch;

impl NeighborSearch for ExactSearch {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn search(
        &self,
        entries: &HashMap<String, IndexEntry>,
        query: &[f32],
        k: usize,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = entries
            .values()
            .map(|entry| Candidate {
                id: entry.id.clone(),
                score: cosine_similarity(query, &entry.vector),
            })
            .collect();

        if candidates.len() > k && k > 0 {
            candidates.select_nth_unstable_by(k - 1, |a, b| {
                rank(a, b, entries)
            });
            candidates.truncate(k);
        }
        candidates
    }
}

/// Result ordering: higher score first, then the newer email, then id.
#[inline]
pub fn rank(a: &Candidate, b: &Candidate, entries: &HashMap<String, IndexEntry>) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| {
        let ts_a = entries.get(&a.id).and_then(|e| e.metadata.timestamp);
        let ts_b = entries.get(&b.id).and_then(|e| e.metadata.timestamp);
        // `Option` orders None first, so reversing puts undated emails last.
        ts_b.cmp(&ts_a).then_with(|| a.id.cmp(&b.id))
    })
}
