//! Delivery lifecycle types using the typestate pattern.
//!
//! Each accepted record is delivered through a `Delivery<T>`, where `T` is the
//! current state of its attempt loop. Only `Delivery<Ready>` can be attempted
//! and only `Delivery<Failed>` can be retried, so a worker cannot skip the
//! retry policy by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::record::{FileRecord, RecordId, RowIndex};
use crate::sink::SinkError;

/// Marker trait for valid delivery states.
pub trait DeliveryState: Send + Sync {}

/// A record moving through its delivery attempts.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery<T: DeliveryState> {
    /// The current state of the delivery.
    pub state: T,
    /// The record being delivered.
    pub record: FileRecord,
}

// ============================================================================
// Delivery States
// ============================================================================

/// The record is ready for its next attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Ready {
    /// Number of attempts already made (0 before the first attempt)
    pub attempts: u32,
    /// Error from the previous attempt, if any
    pub last_error: Option<FailureReason>,
}

impl DeliveryState for Ready {}

/// The sink accepted the record.
#[derive(Debug, Clone, Serialize)]
pub struct Delivered {
    /// Total attempts including the successful one
    pub attempts: u32,
    /// Error from the attempt before the successful one, if any
    pub last_error: Option<FailureReason>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryState for Delivered {}

/// The latest attempt failed.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    /// Total attempts made so far
    pub attempts: u32,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

impl DeliveryState for Failed {}

/// Reason why a delivery attempt failed.
///
/// Distinguishes failures worth retrying from failures that will not change
/// on retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The sink reported a temporary problem (unavailable, throttled).
    Transient { error: String },

    /// The sink refused the record; retrying will not help.
    Permanent { error: String },

    /// The attempt did not finish within the per-attempt timeout.
    Timeout { timeout_ms: u64 },

    /// The sink task terminated unexpectedly (panic).
    Panicked { error: String },
}

impl FailureReason {
    /// Whether another attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            FailureReason::Transient { .. } | FailureReason::Timeout { .. } => true,
            FailureReason::Permanent { .. } | FailureReason::Panicked { .. } => false,
        }
    }

    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::Transient { error } => format!("Transient sink failure: {}", error),
            FailureReason::Permanent { error } => format!("Permanent sink failure: {}", error),
            FailureReason::Timeout { timeout_ms } => {
                format!("Delivery attempt timed out after {}ms", timeout_ms)
            }
            FailureReason::Panicked { error } => format!("Sink task panicked: {}", error),
        }
    }
}

impl From<SinkError> for FailureReason {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Transient(error) => FailureReason::Transient { error },
            SinkError::Permanent(error) => FailureReason::Permanent { error },
        }
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum AttemptResult {
    Delivered(Delivery<Delivered>),
    Failed(Delivery<Failed>),
}

// ============================================================================
// Delivery Summary
// ============================================================================

/// Final outcome of a record's delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// No further attempts will be made (retries used up or failure not retriable).
    Exhausted,
}

/// Summary of one record's delivery, as recorded in the batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryAttempt {
    pub record_id: RecordId,
    pub row_index: RowIndex,
    pub attempts: u32,
    pub last_error: Option<FailureReason>,
    pub outcome: DeliveryOutcome,
}

impl From<&Delivery<Delivered>> for DeliveryAttempt {
    fn from(delivery: &Delivery<Delivered>) -> Self {
        DeliveryAttempt {
            record_id: delivery.record.id,
            row_index: delivery.record.row_index,
            attempts: delivery.state.attempts,
            last_error: delivery.state.last_error.clone(),
            outcome: DeliveryOutcome::Delivered,
        }
    }
}

impl From<&Delivery<Failed>> for DeliveryAttempt {
    fn from(delivery: &Delivery<Failed>) -> Self {
        DeliveryAttempt {
            record_id: delivery.record.id,
            row_index: delivery.record.row_index,
            attempts: delivery.state.attempts,
            last_error: Some(delivery.state.reason.clone()),
            outcome: DeliveryOutcome::Exhausted,
        }
    }
}
