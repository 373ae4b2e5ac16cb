//! Delivery worker pool.
//!
//! A fixed number of tasks pull records from the dispatch queue and run each
//! one through the attempt/retry loop until it is delivered, fails for good,
//! or the batch stops during a backoff. Workers exit when the queue is closed
//! and drained, or as soon as the batch stop signal fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::coordinator::tracker::BatchTracker;
use crate::dedup::Deduplicator;
use crate::domain::delivery::{AttemptResult, Delivery, RetryConfig};
use crate::domain::record::{FileRecord, RecordId};
use crate::queue::DispatchQueue;
use crate::sink::RecordSink;
use crate::telemetry::{DELIVERIES_TOTAL, RECORDS_IN_FLIGHT};

/// Everything a worker needs for one batch.
pub struct WorkerContext<K> {
    pub queue: Arc<DispatchQueue>,
    pub sink: Arc<K>,
    pub tracker: Arc<BatchTracker>,
    pub dedup: Arc<Deduplicator>,
    pub retry: RetryConfig,
    pub attempt_timeout_ms: u64,
    /// Fired on cancellation or deadline: take no new records
    pub stop: CancellationToken,
}

/// Running set of delivery workers for one batch.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
    /// Records taken off the queue whose outcome is not recorded yet
    held: Arc<DashMap<RecordId, FileRecord>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing `context`.
    pub fn spawn<K>(size: usize, context: WorkerContext<K>) -> Self
    where
        K: RecordSink + 'static,
    {
        let context = Arc::new(context);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(DashMap::new());
        let mut tasks = JoinSet::new();

        for worker_id in 0..size {
            tasks.spawn(run_worker(
                worker_id,
                context.clone(),
                in_flight.clone(),
                held.clone(),
            ));
        }

        tracing::debug!(
            batch_id = %context.tracker.batch_id(),
            workers = size,
            "Delivery workers started"
        );

        Self {
            tasks,
            in_flight,
            held,
        }
    }

    /// Shared count of records currently inside the delivery loop.
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    /// Wait for all workers to exit.
    ///
    /// Once `stop` fires, workers still busy get `grace` to finish their
    /// current attempt; whatever is left after that is aborted. Returns, in
    /// row order, the records that never reached an outcome because their
    /// worker was aborted or panicked. Reporting them is left to the caller.
    pub async fn join(mut self, stop: &CancellationToken, grace: Duration) -> Vec<FileRecord> {
        loop {
            tokio::select! {
                biased;
                joined = self.tasks.join_next() => match joined {
                    Some(result) => log_exit(result),
                    None => return self.take_held(),
                },
                _ = stop.cancelled() => break,
            }
        }

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next().await {
                log_exit(result);
            }
        })
        .await;

        if drained.is_ok() {
            return self.take_held();
        }

        let remaining = self.tasks.len();
        tracing::warn!(
            workers = remaining,
            in_flight = self.in_flight.load(Ordering::Relaxed),
            grace_ms = grace.as_millis() as u64,
            "Drain grace elapsed, aborting delivery workers"
        );
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.take_held()
    }

    fn take_held(&self) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self
            .held
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.held.clear();
        records.sort_by_key(|record| record.row_index);
        records
    }
}

fn log_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(join_error) = result {
        tracing::error!(error = %join_error, "Delivery worker panicked");
    }
}

async fn run_worker<K>(
    worker_id: usize,
    context: Arc<WorkerContext<K>>,
    in_flight: Arc<AtomicUsize>,
    held: Arc<DashMap<RecordId, FileRecord>>,
) where
    K: RecordSink + 'static,
{
    loop {
        if context.stop.is_cancelled() {
            tracing::debug!(worker_id, "Stop signal received, worker exiting");
            break;
        }

        let record = tokio::select! {
            biased;
            _ = context.stop.cancelled() => {
                tracing::debug!(worker_id, "Stop signal received, worker exiting");
                break;
            }
            next = context.queue.dequeue() => match next {
                Some(record) => record,
                None => {
                    tracing::trace!(worker_id, "Queue closed and drained, worker exiting");
                    break;
                }
            },
        };

        in_flight.fetch_add(1, Ordering::Relaxed);
        gauge!(RECORDS_IN_FLIGHT).increment(1.0);
        let _guard = scopeguard::guard((), |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
            gauge!(RECORDS_IN_FLIGHT).decrement(1.0);
        });

        // Removed only once an outcome is recorded, so an abort leaves it behind
        let record_id = record.id;
        held.insert(record_id, record.clone());
        deliver_with_retry(worker_id, &context, record).await;
        held.remove(&record_id);
    }
}

/// Drive one record to its final outcome and report it.
#[tracing::instrument(
    skip(context, record),
    fields(batch_id = %context.tracker.batch_id(), record_id = %record.id, row_index = record.row_index)
)]
async fn deliver_with_retry<K>(worker_id: usize, context: &WorkerContext<K>, record: FileRecord)
where
    K: RecordSink + 'static,
{
    let mut delivery = Delivery::new(record);

    loop {
        match delivery
            .attempt(context.sink.clone(), context.attempt_timeout_ms)
            .await
        {
            AttemptResult::Delivered(delivered) => {
                tracing::info!(attempts = delivered.state.attempts, "Record delivered");
                counter!(DELIVERIES_TOTAL, "outcome" => "delivered").increment(1);
                context.tracker.record_delivered(&delivered);
                return;
            }
            AttemptResult::Failed(failed) => match failed.retry(&context.retry) {
                Ok((ready, backoff)) => {
                    tokio::select! {
                        biased;
                        _ = context.stop.cancelled() => {
                            tracing::info!(
                                attempts = ready.state.attempts,
                                "Batch stopped during retry backoff, abandoning record"
                            );
                            context.dedup.release(&ready.record.fingerprint, ready.record.id);
                            context
                                .tracker
                                .record_abandoned(&ready.record, "batch stopped before a retry could run");
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    delivery = ready;
                }
                Err(failed) => {
                    tracing::warn!(
                        attempts = failed.state.attempts,
                        retriable = failed.state.reason.is_retriable(),
                        error = %failed.state.reason.to_error_message(),
                        "Record delivery failed"
                    );
                    counter!(DELIVERIES_TOTAL, "outcome" => "failed").increment(1);
                    context.dedup.release(&failed.record.fingerprint, failed.record.id);
                    context.tracker.record_failed(&failed);
                    return;
                }
            },
        }
    }
}
