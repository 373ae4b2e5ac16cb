//! Concurrent bulk-ingestion pipeline for file-metadata records.
//!
//! A batch is a delimited upload (CSV or TSV) describing many files. Each row
//! is parsed lazily, validated, deduplicated by content fingerprint and handed
//! through a bounded dispatch queue to a pool of delivery workers, which push
//! records to a [`RecordSink`] with per-attempt timeouts and exponential
//! backoff. Every row ends with exactly one outcome in the [`BatchReport`].
//!
//! ```text
//! input ──> RecordParser ──> Validator ──> Deduplicator ──> DispatchQueue ──> workers ──> RecordSink
//!                 │               │              │                               │
//!                 └───────────────┴──────────────┴──────── BatchTracker <────────┘
//! ```
//!
//! The [`BatchCoordinator`] owns one batch at a time per call and ends it as
//! completed, timed out or cancelled.

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod parser;
pub mod queue;
pub mod sink;
pub mod telemetry;
pub mod validator;
pub mod worker;

// Re-export commonly used types
pub use config::{ColumnMapping, PipelineConfig};
pub use coordinator::{BatchCoordinator, BatchTracker};
pub use dedup::{DedupOutcome, Deduplicator};
pub use domain::batch::{BatchCounters, BatchId, BatchReport, BatchState, FailureKind, RowFailure};
pub use domain::delivery::{DeliveryAttempt, DeliveryOutcome, FailureReason, RetryConfig};
pub use domain::record::{FileRecord, Fingerprint, RecordId, RowIndex};
pub use error::{HopperError, Result};
pub use parser::{InputFormat, ParseItem, RecordParser};
pub use queue::{DispatchQueue, EnqueueError};
pub use sink::{HttpSink, HttpSinkConfig, MockSink, RecordSink, SinkError, SinkResult};
pub use validator::{RejectionReason, ValidationOutcome, Validator};
