//! Polled progress counter for the build phase.


use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Counters {
    total: AtomicUsize,
    processed: AtomicUsize,
    indexed: AtomicUsize,
    unchanged: AtomicUsize,
    skipped: AtomicUsize,
    finished: AtomicBool,
}

/// Shared counter the indexer updates and callers poll. Clones observe the
/// same counts.
#[derive(Debug, Clone, Default)]
pub struct IndexProgress {
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl ProgressSnapshot {
    #[inline]
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}

impl IndexProgress {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set_total(&self, total: usize) {
        self.counters.total.store(total, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_indexed(&self) {
        self.counters.indexed.fetch_add(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unchanged(&self) {
        self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn finish(&self) {
        self.counters.finished.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.counters.finished.load(Ordering::Acquire)
    }

    #[inline]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.counters.total.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            indexed: self.counters.indexed.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}
