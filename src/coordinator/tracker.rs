//! Per-batch outcome tracking.
//!
//! Counters are lock-free atomics. Every record gets exactly one final
//! outcome: completion is keyed by record id, so a second report for the
//! same record is ignored. The batch state moves out of `Running` once and
//! the first terminal state wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use metrics::counter;
use parking_lot::Mutex;

use crate::domain::batch::{BatchCounters, BatchId, BatchReport, BatchState, FailureKind, RowFailure};
use crate::domain::delivery::{Delivered, Delivery, DeliveryAttempt, Failed};
use crate::domain::record::{FileRecord, RecordId, RowIndex};
use crate::telemetry::RECORDS_TOTAL;
use crate::validator::RejectionReason;

#[derive(Debug, Default)]
struct Counters {
    parsed: AtomicU64,
    row_errors: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicate: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Shared, concurrently updated record of a running batch.
#[derive(Debug)]
pub struct BatchTracker {
    batch_id: BatchId,
    started_at: DateTime<Utc>,
    state: Mutex<BatchState>,
    counters: Counters,
    completed: DashSet<RecordId>,
    failures: Mutex<Vec<RowFailure>>,
    deliveries: Mutex<Vec<DeliveryAttempt>>,
    stream_error: Mutex<Option<String>>,
}

fn outcome_metric(outcome: &'static str) {
    counter!(RECORDS_TOTAL, "outcome" => outcome).increment(1);
}

impl BatchTracker {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            started_at: Utc::now(),
            state: Mutex::new(BatchState::Running),
            counters: Counters::default(),
            completed: DashSet::new(),
            failures: Mutex::new(Vec::new()),
            deliveries: Mutex::new(Vec::new()),
            stream_error: Mutex::new(None),
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn state(&self) -> BatchState {
        *self.state.lock()
    }

    /// Move to a terminal state. Returns false if the batch already ended.
    pub fn transition(&self, to: BatchState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            tracing::debug!(
                batch_id = %self.batch_id,
                current = %*state,
                requested = %to,
                "Batch already ended, ignoring state change"
            );
            return false;
        }
        *state = to;
        true
    }

    /// Claim the single final outcome for a record.
    fn complete_once(&self, record_id: RecordId) -> bool {
        let first = self.completed.insert(record_id);
        if !first {
            tracing::warn!(record_id = %record_id, "Ignoring duplicate outcome for record");
        }
        first
    }

    fn push_failure(&self, row_index: RowIndex, record_id: Option<RecordId>, kind: FailureKind, reason: String) {
        self.failures.lock().push(RowFailure {
            row_index,
            record_id,
            kind,
            reason,
        });
    }

    pub fn record_parsed(&self) {
        self.counters.parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row_error(&self, row_index: RowIndex, reason: String) {
        self.counters.row_errors.fetch_add(1, Ordering::Relaxed);
        outcome_metric("row_error");
        self.push_failure(row_index, None, FailureKind::Parse, reason);
    }

    /// Passed validation; the record still goes through dedup.
    pub fn record_accepted(&self) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, record: &FileRecord, reason: &RejectionReason) -> bool {
        if !self.complete_once(record.id) {
            return false;
        }
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        outcome_metric("rejected");
        self.push_failure(
            record.row_index,
            Some(record.id),
            FailureKind::Rejected,
            reason.to_string(),
        );
        true
    }

    pub fn record_duplicate(&self, record: &FileRecord, original: RecordId) -> bool {
        if !self.complete_once(record.id) {
            return false;
        }
        self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
        outcome_metric("duplicate");
        self.push_failure(
            record.row_index,
            Some(record.id),
            FailureKind::Duplicate,
            format!("duplicate of record {}", original.0),
        );
        true
    }

    pub fn record_delivered(&self, delivery: &Delivery<Delivered>) -> bool {
        if !self.complete_once(delivery.record.id) {
            return false;
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        outcome_metric("delivered");
        self.deliveries.lock().push(DeliveryAttempt::from(delivery));
        true
    }

    /// Delivery failed permanently or used up its attempts.
    pub fn record_failed(&self, delivery: &Delivery<Failed>) -> bool {
        if !self.complete_once(delivery.record.id) {
            return false;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        outcome_metric("failed");
        self.push_failure(
            delivery.record.row_index,
            Some(delivery.record.id),
            FailureKind::DeliveryFailed,
            format!(
                "{} (after {} attempt{})",
                delivery.state.reason.to_error_message(),
                delivery.state.attempts,
                if delivery.state.attempts == 1 { "" } else { "s" }
            ),
        );
        self.deliveries.lock().push(DeliveryAttempt::from(delivery));
        true
    }

    /// The record never got a queue slot within the enqueue timeout.
    pub fn record_enqueue_timeout(&self, record: &FileRecord, timeout: Duration) -> bool {
        if !self.complete_once(record.id) {
            return false;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        outcome_metric("failed");
        self.push_failure(
            record.row_index,
            Some(record.id),
            FailureKind::DeliveryFailed,
            format!(
                "backpressure: dispatch queue stayed full for {}ms",
                timeout.as_millis()
            ),
        );
        true
    }

    /// The batch stopped before the record could be delivered.
    ///
    /// Listed in the report but not counted as failed.
    pub fn record_abandoned(&self, record: &FileRecord, reason: &str) -> bool {
        if !self.complete_once(record.id) {
            return false;
        }
        outcome_metric("abandoned");
        self.push_failure(
            record.row_index,
            Some(record.id),
            FailureKind::Abandoned,
            reason.to_string(),
        );
        true
    }

    /// Keeps the first error if called more than once.
    pub fn set_stream_error(&self, reason: String) {
        let mut stream_error = self.stream_error.lock();
        if stream_error.is_none() {
            *stream_error = Some(reason);
        }
    }

    pub fn counters(&self) -> BatchCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BatchCounters {
            parsed: load(&self.counters.parsed),
            row_errors: load(&self.counters.row_errors),
            accepted: load(&self.counters.accepted),
            rejected: load(&self.counters.rejected),
            duplicate: load(&self.counters.duplicate),
            delivered: load(&self.counters.delivered),
            failed: load(&self.counters.failed),
        }
    }

    /// Build the report with outcomes in row order.
    pub fn report(&self) -> BatchReport {
        let mut failures = self.failures.lock().clone();
        failures.sort_by_key(|failure| failure.row_index);
        let mut deliveries = self.deliveries.lock().clone();
        deliveries.sort_by_key(|delivery| delivery.row_index);

        BatchReport {
            batch_id: self.batch_id,
            state: self.state(),
            counters: self.counters(),
            failures,
            deliveries,
            stream_error: self.stream_error.lock().clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::{DeliveryOutcome, FailureReason};

    fn record(row: RowIndex, filename: &str) -> FileRecord {
        FileRecord::new(row, "pdf", 10, filename, "Doc")
    }

    fn delivered(record: FileRecord, attempts: u32) -> Delivery<Delivered> {
        Delivery {
            record,
            state: Delivered {
                attempts,
                last_error: None,
                delivered_at: Utc::now(),
            },
        }
    }

    fn failed(record: FileRecord, attempts: u32) -> Delivery<Failed> {
        Delivery {
            record,
            state: Failed {
                attempts,
                reason: FailureReason::Transient {
                    error: "unavailable".to_string(),
                },
                failed_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let tracker = BatchTracker::new(BatchId::new());
        assert_eq!(tracker.state(), BatchState::Running);
        assert!(tracker.transition(BatchState::TimedOut));
        assert!(!tracker.transition(BatchState::Cancelled));
        assert!(!tracker.transition(BatchState::Completed));
        assert_eq!(tracker.state(), BatchState::TimedOut);
    }

    #[test]
    fn test_outcome_recorded_once_per_record() {
        let tracker = BatchTracker::new(BatchId::new());
        let record = record(1, "a.pdf");
        tracker.record_parsed();
        tracker.record_accepted();

        assert!(tracker.record_delivered(&delivered(record.clone(), 1)));
        assert!(!tracker.record_delivered(&delivered(record.clone(), 2)));
        assert!(!tracker.record_failed(&failed(record.clone(), 3)));
        assert!(!tracker.record_abandoned(&record, "stopped"));

        let counters = tracker.counters();
        assert_eq!(counters.delivered, 1);
        assert_eq!(counters.failed, 0);
        assert!(counters.is_reconciled());

        let report = tracker.report();
        assert_eq!(report.deliveries.len(), 1);
        assert_eq!(report.deliveries[0].attempts, 1);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_report_orders_outcomes_by_row() {
        let tracker = BatchTracker::new(BatchId::new());
        let first = record(1, "a.pdf");
        let third = record(3, "c.pdf");
        let fourth = record(4, "d.pdf");

        // Completion order differs from row order
        tracker.record_failed(&failed(fourth.clone(), 3));
        tracker.record_delivered(&delivered(third.clone(), 1));
        tracker.record_row_error(2, "wrong field count".to_string());
        tracker.record_rejected(&first, &RejectionReason::EmptyFile);
        tracker.record_delivered(&delivered(first.clone(), 1));

        let report = tracker.report();
        let rows: Vec<_> = report.failures.iter().map(|f| f.row_index).collect();
        assert_eq!(rows, vec![1, 2, 4]);
        assert_eq!(report.failures[0].kind, FailureKind::Rejected);
        assert_eq!(report.failures[1].kind, FailureKind::Parse);
        assert_eq!(report.failures[1].record_id, None);
        assert_eq!(report.failures[2].kind, FailureKind::DeliveryFailed);
        assert!(report.failures[2].reason.contains("after 3 attempts"));

        let rows: Vec<_> = report.deliveries.iter().map(|d| d.row_index).collect();
        assert_eq!(rows, vec![3, 4]);
        assert_eq!(report.deliveries[1].outcome, DeliveryOutcome::Exhausted);
        assert_eq!(report.counters.row_errors, 1);
    }

    #[test]
    fn test_abandoned_and_enqueue_timeout() {
        let tracker = BatchTracker::new(BatchId::new());
        let slow = record(1, "a.pdf");
        let stopped = record(2, "b.pdf");

        tracker.record_enqueue_timeout(&slow, Duration::from_millis(250));
        tracker.record_abandoned(&stopped, "batch cancelled");

        let counters = tracker.counters();
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.resolved(), 1);

        let report = tracker.report();
        assert!(report.failures[0].reason.contains("250ms"));
        assert_eq!(report.failures[1].kind, FailureKind::Abandoned);
    }

    #[test]
    fn test_stream_error_keeps_first() {
        let tracker = BatchTracker::new(BatchId::new());
        tracker.set_stream_error("connection reset".to_string());
        tracker.set_stream_error("later".to_string());
        assert_eq!(tracker.report().stream_error.as_deref(), Some("connection reset"));
    }
}
