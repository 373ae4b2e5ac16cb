//! Fingerprint-based deduplication.
//!
//! The map holds fingerprints of records that are in flight or delivered.
//! `check_and_mark` runs under the map's per-shard write lock for the
//! fingerprint's entry, so two concurrent callers can never both see
//! `Unique` for the same fingerprint.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::domain::record::{FileRecord, Fingerprint, RecordId};

/// Result of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Unique,
    /// Carries the id of the record that first claimed the fingerprint
    Duplicate(RecordId),
}

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    record_id: RecordId,
    first_seen: Instant,
}

/// Tracks first-seen records per fingerprint within a window.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: DashMap<Fingerprint, SeenEntry>,
    /// None: entries live as long as the deduplicator (one batch)
    window: Option<Duration>,
}

impl Deduplicator {
    /// Deduplicator whose entries never expire; scope it to one batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicator whose entries expire `window` after they were first seen.
    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window: Some(window),
        }
    }

    pub fn window(&self) -> Option<Duration> {
        self.window
    }

    fn is_expired(&self, entry: &SeenEntry, now: Instant) -> bool {
        self.window
            .is_some_and(|window| now.saturating_duration_since(entry.first_seen) >= window)
    }

    /// Atomically check whether the record's fingerprint was seen and claim it if not.
    pub fn check_and_mark(&self, record: &FileRecord) -> DedupOutcome {
        let now = Instant::now();
        let fresh = SeenEntry {
            record_id: record.id,
            first_seen: now,
        };

        match self.seen.entry(record.fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    occupied.insert(fresh);
                    DedupOutcome::Unique
                } else {
                    DedupOutcome::Duplicate(occupied.get().record_id)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                DedupOutcome::Unique
            }
        }
    }

    /// Forget a fingerprint, but only while `record_id` still owns it.
    ///
    /// Used for records that were never delivered, so a later submission of
    /// the same content is not suppressed. Returns whether an entry was removed.
    pub fn release(&self, fingerprint: &Fingerprint, record_id: RecordId) -> bool {
        self.seen
            .remove_if(fingerprint, |_, entry| entry.record_id == record_id)
            .is_some()
    }

    /// Drop entries whose window has closed. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        if self.window.is_none() {
            return 0;
        }
        let now = Instant::now();
        let before = self.seen.len();
        self.seen.retain(|_, entry| !self.is_expired(entry, now));
        let evicted = before.saturating_sub(self.seen.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.seen.len(), "Evicted expired dedup entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(filename: &str) -> FileRecord {
        FileRecord::new(1, "pdf", 100, filename, "Doc")
    }

    #[test]
    fn test_first_is_unique_rest_are_duplicates() {
        let dedup = Deduplicator::new();
        let first = record("a.pdf");
        let second = record("a.pdf");
        let third = record("a.pdf");

        assert_eq!(dedup.check_and_mark(&first), DedupOutcome::Unique);
        assert_eq!(dedup.check_and_mark(&second), DedupOutcome::Duplicate(first.id));
        assert_eq!(dedup.check_and_mark(&third), DedupOutcome::Duplicate(first.id));
        assert_eq!(dedup.check_and_mark(&record("b.pdf")), DedupOutcome::Unique);
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_release_only_by_owner() {
        let dedup = Deduplicator::new();
        let first = record("a.pdf");
        let other = record("a.pdf");
        dedup.check_and_mark(&first);

        assert!(!dedup.release(&first.fingerprint, other.id));
        assert_eq!(dedup.check_and_mark(&other), DedupOutcome::Duplicate(first.id));

        assert!(dedup.release(&first.fingerprint, first.id));
        assert_eq!(dedup.check_and_mark(&other), DedupOutcome::Unique);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_and_eviction() {
        let dedup = Deduplicator::with_window(Duration::from_secs(60));
        let first = record("a.pdf");
        assert_eq!(dedup.check_and_mark(&first), DedupOutcome::Unique);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            dedup.check_and_mark(&record("a.pdf")),
            DedupOutcome::Duplicate(first.id)
        );
        assert_eq!(dedup.evict_expired(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        // Expired entries are replaced on access...
        let later = record("a.pdf");
        assert_eq!(dedup.check_and_mark(&later), DedupOutcome::Unique);
        assert_eq!(
            dedup.check_and_mark(&record("a.pdf")),
            DedupOutcome::Duplicate(later.id)
        );

        // ...and swept otherwise
        dedup.check_and_mark(&record("b.pdf"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(dedup.evict_expired(), 2);
        assert!(dedup.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_yield_single_unique() {
        let dedup = Arc::new(Deduplicator::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move {
                dedup.check_and_mark(&record("contended.pdf"))
            }));
        }

        let mut unique = 0;
        for handle in handles {
            if handle.await.unwrap() == DedupOutcome::Unique {
                unique += 1;
            }
        }
        assert_eq!(unique, 1);
        assert_eq!(dedup.len(), 1);
    }
}
