//! Bounded dispatch queue between the producer path and the delivery workers.
//!
//! Backed by a bounded tokio channel. Producers reserve a slot before handing
//! over a record, so a failed or abandoned enqueue always gives the record
//! back to the caller instead of dropping it. Closing drops the queue's own
//! sender: once every in-progress enqueue has finished, consumers see the
//! remaining items and then `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::domain::record::FileRecord;
use crate::error::HopperError;

/// Why a record could not be enqueued. The record is handed back.
#[derive(Debug)]
pub enum EnqueueError {
    /// The queue was closed before a slot became available
    Closed(FileRecord),
    /// No slot became available within the enqueue timeout
    Timeout(FileRecord, Duration),
}

impl EnqueueError {
    pub fn into_record(self) -> FileRecord {
        match self {
            EnqueueError::Closed(record) | EnqueueError::Timeout(record, _) => record,
        }
    }
}

impl From<EnqueueError> for HopperError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Closed(_) => HopperError::QueueClosed,
            EnqueueError::Timeout(_, timeout) => HopperError::EnqueueTimeout(timeout.as_millis() as u64),
        }
    }
}

/// Bounded FIFO of records awaiting delivery.
pub struct DispatchQueue {
    /// None once closed
    tx: RwLock<Option<mpsc::Sender<FileRecord>>>,
    rx: Mutex<mpsc::Receiver<FileRecord>>,
    closed: CancellationToken,
    capacity: usize,
    depth: AtomicUsize,
}

impl DispatchQueue {
    /// # Panics
    /// Panics if `capacity` is zero (rejected earlier by config validation).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            capacity,
            depth: AtomicUsize::new(0),
        }
    }

    /// Enqueue a record, waiting while the queue is full.
    ///
    /// With `timeout`, gives up after that long. Fails immediately, or as soon
    /// as the queue closes while waiting, with [`EnqueueError::Closed`].
    pub async fn enqueue(
        &self,
        record: FileRecord,
        timeout: Option<Duration>,
    ) -> Result<(), EnqueueError> {
        let Some(tx) = self.tx.read().clone() else {
            return Err(EnqueueError::Closed(record));
        };

        let reserve = async {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                permit = tx.reserve() => permit.ok(),
            }
        };

        let permit = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reserve).await {
                Ok(permit) => permit,
                Err(_) => return Err(EnqueueError::Timeout(record, timeout)),
            },
            None => reserve.await,
        };

        match permit {
            Some(permit) => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                permit.send(record);
                Ok(())
            }
            None => Err(EnqueueError::Closed(record)),
        }
    }

    /// Take the next record, waiting while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<FileRecord> {
        let record = self.rx.lock().await.recv().await;
        if record.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        record
    }

    /// Take every buffered record without waiting.
    ///
    /// Returns nothing while a consumer is blocked in [`dequeue`](Self::dequeue).
    pub fn drain_remaining(&self) -> Vec<FileRecord> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Vec::new();
        };
        let mut remaining = Vec::new();
        while let Ok(record) = rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            remaining.push(record);
        }
        remaining
    }

    /// Close the queue. Buffered records still drain; new enqueues fail.
    pub fn close(&self) {
        if self.tx.write().take().is_some() {
            tracing::debug!(pending = self.len(), "Dispatch queue closed");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
