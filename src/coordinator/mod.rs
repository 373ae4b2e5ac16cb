//! Batch coordinator: runs one bulk-ingestion request end to end.
//!
//! Per batch the coordinator wires up:
//! - a producer path (in the calling task) that parses, validates,
//!   deduplicates and enqueues records in row order;
//! - a pool of delivery workers draining the dispatch queue;
//! - a watchdog that ends the batch on deadline or caller cancellation;
//! - optionally, a periodic status log.
//!
//! The batch ends `Completed` when every parsed record has a final outcome,
//! or `TimedOut` / `Cancelled` when the watchdog fires first.

pub mod tracker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::domain::batch::{BatchId, BatchReport, BatchState};
use crate::domain::delivery::RetryConfig;
use crate::error::Result;
use crate::parser::{InputFormat, ParseItem, RecordParser};
use crate::queue::{DispatchQueue, EnqueueError};
use crate::sink::RecordSink;
use crate::telemetry::{BATCH_DURATION_SECONDS, BATCHES_TOTAL};
use crate::validator::{ValidationOutcome, Validator};
use crate::worker::{WorkerContext, WorkerPool};

pub use tracker::BatchTracker;

/// Runs batches against a sink.
///
/// One coordinator can run several batches at once; they share the sink
/// and, when a rolling dedup window is configured, the deduplicator.
///
/// # Example
/// ```ignore
/// let sink = Arc::new(HttpSink::new(HttpSinkConfig::new(endpoint))?);
/// let coordinator = BatchCoordinator::new(sink, PipelineConfig::default())?;
/// let report = coordinator
///     .run_batch(file, InputFormat::Csv, CancellationToken::new())
///     .await;
/// ```
pub struct BatchCoordinator<K> {
    sink: Arc<K>,
    config: PipelineConfig,
    validator: Validator,
    /// Present only with a rolling dedup window
    shared_dedup: Option<Arc<Deduplicator>>,
}

/// Per-batch handles shared by the producer path.
struct BatchContext {
    tracker: Arc<BatchTracker>,
    dedup: Arc<Deduplicator>,
    queue: Arc<DispatchQueue>,
    stop: CancellationToken,
}

impl<K> BatchCoordinator<K>
where
    K: RecordSink + 'static,
{
    pub fn new(sink: Arc<K>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let shared_dedup = config
            .dedup_window()
            .map(|window| Arc::new(Deduplicator::with_window(window)));

        Ok(Self {
            sink,
            validator: Validator::from_config(&config),
            config,
            shared_dedup,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The deduplicator shared across batches, if a rolling window is configured.
    pub fn shared_deduplicator(&self) -> Option<&Arc<Deduplicator>> {
        self.shared_dedup.as_ref()
    }

    /// Run a batch under a fresh id. See [`run_batch_with_id`](Self::run_batch_with_id).
    pub async fn run_batch<R>(
        &self,
        input: R,
        format: InputFormat,
        cancel: CancellationToken,
    ) -> BatchReport
    where
        R: AsyncRead + Unpin + Send,
    {
        self.run_batch_with_id(BatchId::new(), input, format, cancel)
            .await
    }

    /// Run a batch to a terminal state and return its report.
    ///
    /// Never fails: an unreadable input or missing header column ends up as
    /// the report's `stream_error`. Cancelling `cancel` ends the batch as
    /// `Cancelled`; exceeding the configured deadline ends it as `TimedOut`.
    #[tracing::instrument(skip(self, batch_id, input, cancel), fields(batch_id = %batch_id))]
    pub async fn run_batch_with_id<R>(
        &self,
        batch_id: BatchId,
        input: R,
        format: InputFormat,
        cancel: CancellationToken,
    ) -> BatchReport
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        tracing::info!("Batch started");

        let dedup = match &self.shared_dedup {
            Some(shared) => {
                shared.evict_expired();
                shared.clone()
            }
            None => Arc::new(Deduplicator::new()),
        };
        let batch = BatchContext {
            tracker: Arc::new(BatchTracker::new(batch_id)),
            dedup,
            queue: Arc::new(DispatchQueue::new(self.config.queue_capacity)),
            stop: CancellationToken::new(),
        };
        // Fired once the batch has settled; ends the background tasks
        let finished = CancellationToken::new();

        let watchdog = self.spawn_watchdog(&batch, cancel, finished.clone());

        let pool = WorkerPool::spawn(
            self.config.worker_pool_size,
            WorkerContext {
                queue: batch.queue.clone(),
                sink: self.sink.clone(),
                tracker: batch.tracker.clone(),
                dedup: batch.dedup.clone(),
                retry: RetryConfig::from(&self.config),
                attempt_timeout_ms: self.config.attempt_timeout_ms,
                stop: batch.stop.clone(),
            },
        );

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            spawn_status_log(&batch, pool.in_flight(), interval_ms, finished.clone());
        }

        self.produce(&batch, input, format).await;

        // No more input: let the workers drain what was queued
        batch.queue.close();
        let unfinished = pool.join(&batch.stop, self.config.drain_grace()).await;
        if !unfinished.is_empty() {
            tracing::warn!(
                records = unfinished.len(),
                "Records left without an outcome by stopped workers"
            );
        }
        for record in unfinished {
            batch.dedup.release(&record.fingerprint, record.id);
            batch
                .tracker
                .record_abandoned(&record, "delivery aborted when the batch stopped");
        }

        for record in batch.queue.drain_remaining() {
            batch.dedup.release(&record.fingerprint, record.id);
            batch
                .tracker
                .record_abandoned(&record, "batch stopped before the record was delivered");
        }

        if batch.tracker.state() == BatchState::Running {
            let counters = batch.tracker.counters();
            if counters.is_reconciled() {
                batch.tracker.transition(BatchState::Completed);
            } else {
                tracing::error!(
                    parsed = counters.parsed,
                    resolved = counters.resolved(),
                    "Batch ended with unresolved records"
                );
                batch.tracker.transition(BatchState::Cancelled);
            }
        }

        finished.cancel();
        if let Err(e) = watchdog.await {
            tracing::error!(error = %e, "Batch watchdog panicked");
        }

        let report = batch.tracker.report();
        counter!(BATCHES_TOTAL, "state" => report.state.as_str()).increment(1);
        histogram!(BATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        tracing::info!(
            state = %report.state,
            parsed = report.counters.parsed,
            row_errors = report.counters.row_errors,
            rejected = report.counters.rejected,
            duplicate = report.counters.duplicate,
            delivered = report.counters.delivered,
            failed = report.counters.failed,
            stream_error = report.stream_error.as_deref(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );

        report
    }

    /// End the batch on deadline or caller cancellation, whichever comes first.
    fn spawn_watchdog(
        &self,
        batch: &BatchContext,
        cancel: CancellationToken,
        finished: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = batch.tracker.clone();
        let queue = batch.queue.clone();
        let stop = batch.stop.clone();
        let deadline = self.config.batch_deadline();

        tokio::spawn(async move {
            let cutoff = tokio::select! {
                biased;
                _ = finished.cancelled() => return,
                _ = cancel.cancelled() => BatchState::Cancelled,
                _ = tokio::time::sleep(deadline) => BatchState::TimedOut,
            };

            if tracker.transition(cutoff) {
                let counters = tracker.counters();
                tracing::warn!(
                    batch_id = %tracker.batch_id(),
                    state = %cutoff,
                    parsed = counters.parsed,
                    resolved = counters.resolved(),
                    queued = queue.len(),
                    "Batch stopped before completion"
                );
            }
            queue.close();
            stop.cancel();
        })
    }

    /// Producer path: parse, validate, dedup and enqueue in row order.
    async fn produce<R>(&self, batch: &BatchContext, input: R, format: InputFormat)
    where
        R: AsyncRead + Unpin + Send,
    {
        let opened = tokio::select! {
            biased;
            _ = batch.stop.cancelled() => return,
            opened = RecordParser::with_spreadsheet_limit(
                input,
                format,
                &self.config.columns,
                self.config.max_spreadsheet_bytes,
            ) => opened,
        };
        let mut parser = match opened {
            Ok(parser) => parser,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read batch input header");
                batch.tracker.set_stream_error(e.to_string());
                return;
            }
        };

        let enqueue_timeout = self.config.enqueue_timeout();

        loop {
            let item = tokio::select! {
                biased;
                _ = batch.stop.cancelled() => break,
                item = parser.next_item() => item,
            };
            let Some(item) = item else {
                break;
            };

            let record = match item {
                ParseItem::Record(record) => record,
                ParseItem::RowError { row_index, reason } => {
                    tracing::debug!(row_index, reason = %reason, "Skipping malformed row");
                    batch.tracker.record_row_error(row_index, reason);
                    continue;
                }
                ParseItem::StreamError(reason) => {
                    batch.tracker.set_stream_error(reason);
                    break;
                }
            };
            batch.tracker.record_parsed();

            if let ValidationOutcome::Rejected(reason) = self.validator.validate(&record) {
                tracing::debug!(row_index = record.row_index, reason = %reason, "Record rejected");
                batch.tracker.record_rejected(&record, &reason);
                continue;
            }
            batch.tracker.record_accepted();

            if let DedupOutcome::Duplicate(original) = batch.dedup.check_and_mark(&record) {
                tracing::debug!(
                    row_index = record.row_index,
                    fingerprint = %record.fingerprint,
                    original = %original,
                    "Duplicate record skipped"
                );
                batch.tracker.record_duplicate(&record, original);
                continue;
            }

            match batch.queue.enqueue(record, enqueue_timeout).await {
                Ok(()) => {}
                Err(EnqueueError::Timeout(record, timeout)) => {
                    tracing::warn!(
                        row_index = record.row_index,
                        timeout_ms = timeout.as_millis() as u64,
                        "Dispatch queue full, record not enqueued"
                    );
                    batch.dedup.release(&record.fingerprint, record.id);
                    batch.tracker.record_enqueue_timeout(&record, timeout);
                }
                Err(EnqueueError::Closed(record)) => {
                    batch.dedup.release(&record.fingerprint, record.id);
                    batch
                        .tracker
                        .record_abandoned(&record, "batch stopped before the record was queued");
                    break;
                }
            }
        }

        tracing::debug!(rows_read = parser.rows_read(), "Producer finished");
    }
}

fn spawn_status_log(
    batch: &BatchContext,
    in_flight: Arc<AtomicUsize>,
    interval_ms: u64,
    finished: CancellationToken,
) {
    let tracker = batch.tracker.clone();
    let queue = batch.queue.clone();
    let dedup = batch.dedup.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = finished.cancelled() => break,
                _ = interval.tick() => {
                    let counters = tracker.counters();
                    let evicted = dedup.evict_expired();
                    tracing::debug!(
                        batch_id = %tracker.batch_id(),
                        queue_depth = queue.len(),
                        queue_capacity = queue.capacity(),
                        in_flight = in_flight.load(Ordering::Relaxed),
                        parsed = counters.parsed,
                        resolved = counters.resolved(),
                        dedup_entries = dedup.len(),
                        evicted,
                        "Batch status"
                    );
                }
            }
        }
    });
}
