//! Core domain types for the ingestion pipeline.
//!
//! This module contains pure domain types with no I/O:
//! - File-metadata records and fingerprints
//! - Batches, counters and the batch report
//! - Delivery typestate machine

pub mod batch;
pub mod delivery;
pub mod record;

pub use batch::{BatchCounters, BatchId, BatchReport, BatchState, FailureKind, RowFailure};
pub use record::{FileRecord, Fingerprint, RecordId, RowIndex};
