//! Batch types: identity, lifecycle state, outcome counters and the final report.
//!
//! A batch is one bulk-ingestion request. It starts `Running` and ends in
//! exactly one terminal state; the report is the only artefact that outlives it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delivery::DeliveryAttempt;
use super::record::{RecordId, RowIndex};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a batch.
///
/// `Running` is initial; the other three are terminal and never change once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    /// Every record resolved before the deadline
    Completed,
    /// External cancellation signal received
    Cancelled,
    /// Deadline elapsed with records still unresolved
    TimedOut,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
            BatchState::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchState::Running),
            "completed" => Ok(BatchState::Completed),
            "cancelled" => Ok(BatchState::Cancelled),
            "timed_out" => Ok(BatchState::TimedOut),
            _ => Err(format!("Invalid batch state: {}", s)),
        }
    }
}

/// Snapshot of a batch's outcome counters.
///
/// `accepted` counts records that passed validation, duplicates included, so
/// once a batch completes:
/// - `accepted + rejected == parsed`
/// - `delivered + failed == accepted - duplicate`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    /// Records successfully parsed from the input
    pub parsed: u64,
    /// Rows that could not be parsed into a record
    pub row_errors: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicate: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl BatchCounters {
    /// Records with a final outcome.
    pub fn resolved(&self) -> u64 {
        self.rejected + self.duplicate + self.delivered + self.failed
    }

    /// Whether every parsed record has a final outcome.
    pub fn is_reconciled(&self) -> bool {
        self.resolved() == self.parsed
    }

    /// Total rows read from the input, parseable or not.
    pub fn total_rows(&self) -> u64 {
        self.parsed + self.row_errors
    }
}

/// Category of a per-row failure in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The row could not be parsed into a record
    Parse,
    /// The record failed validation
    Rejected,
    /// The record duplicates one seen earlier in the dedup window
    Duplicate,
    /// Delivery failed permanently or ran out of attempts
    DeliveryFailed,
    /// The batch stopped before the record could be delivered
    Abandoned,
}

/// One failed row, as listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_index: RowIndex,
    /// Absent for rows that never became a record
    pub record_id: Option<RecordId>,
    pub kind: FailureKind,
    pub reason: String,
}

/// The artefact emitted when a batch ends.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub state: BatchState,
    pub counters: BatchCounters,
    /// Failures ordered by row index
    pub failures: Vec<RowFailure>,
    /// Delivery summaries ordered by row index
    pub deliveries: Vec<DeliveryAttempt>,
    /// Set when the input stream became unreadable and parsing stopped early
    pub stream_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn total_rows(&self) -> u64 {
        self.counters.total_rows()
    }

    /// Whether the batch ran to completion over the whole input.
    pub fn is_complete(&self) -> bool {
        self.state == BatchState::Completed && self.stream_error.is_none()
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &RowFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    pub fn delivery_for(&self, record_id: RecordId) -> Option<&DeliveryAttempt> {
        self.deliveries.iter().find(|d| d.record_id == record_id)
    }

    /// Suggested HTTP status for an ingress layer answering with this report.
    ///
    /// - 200: completed over the whole input
    /// - 400: the stream was unreadable and nothing was delivered
    /// - 207: partial result (timed out, cancelled, or stream error after progress)
    pub fn http_status(&self) -> u16 {
        match (self.state, &self.stream_error) {
            (BatchState::Completed, None) => 200,
            (BatchState::Completed, Some(_)) if self.counters.delivered == 0 => 400,
            _ => 207,
        }
    }
}
