//! Metric names and descriptions.
//!
//! The pipeline records through the `metrics` facade. Installing a recorder
//! (Prometheus exporter, statsd, ...) is left to the host process; without
//! one every call is a no-op.
//!
//! - **Counters**: records by outcome, delivery attempts, retries, batches
//! - **Gauges**: records currently inside the delivery loop
//! - **Histograms**: attempt and batch durations

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

/// Final outcome per record, labelled `outcome`.
pub const RECORDS_TOTAL: &str = "hopper_records_total";
/// Finished delivery loops, labelled `outcome` (delivered / failed).
pub const DELIVERIES_TOTAL: &str = "hopper_deliveries_total";
/// Failed sink attempts, labelled `retriable`.
pub const ATTEMPT_FAILURES_TOTAL: &str = "hopper_delivery_attempt_failures_total";
/// Retries refused, labelled `reason`.
pub const RETRY_DENIED_TOTAL: &str = "hopper_retry_denied_total";
/// Finished batches, labelled `state`.
pub const BATCHES_TOTAL: &str = "hopper_batches_total";
pub const RECORDS_IN_FLIGHT: &str = "hopper_records_in_flight";
pub const ATTEMPT_DURATION_SECONDS: &str = "hopper_delivery_attempt_duration_seconds";
pub const BATCH_DURATION_SECONDS: &str = "hopper_batch_duration_seconds";

/// Register descriptions with the installed recorder.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(RECORDS_TOTAL, Unit::Count, "Records by final outcome");
    describe_counter!(
        DELIVERIES_TOTAL,
        Unit::Count,
        "Records that left the delivery loop, by outcome"
    );
    describe_counter!(
        ATTEMPT_FAILURES_TOTAL,
        Unit::Count,
        "Failed delivery attempts, by whether they can be retried"
    );
    describe_counter!(
        RETRY_DENIED_TOTAL,
        Unit::Count,
        "Retries refused because the attempt limit was reached"
    );
    describe_counter!(BATCHES_TOTAL, Unit::Count, "Finished batches by terminal state");
    describe_gauge!(
        RECORDS_IN_FLIGHT,
        Unit::Count,
        "Records currently being delivered or waiting out a retry backoff"
    );
    describe_histogram!(
        ATTEMPT_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of a single delivery attempt"
    );
    describe_histogram!(
        BATCH_DURATION_SECONDS,
        Unit::Seconds,
        "Wall-clock duration of a batch"
    );
}
