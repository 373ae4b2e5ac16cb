//! State transitions for record delivery.
//!
//! ```text
//! Delivery<Ready> ──attempt()──> Delivery<Delivered>
//!        ^                   └──> Delivery<Failed> ──retry()──> (Delivery<Ready>, backoff)
//!        │                                              └────> Err(Delivery<Failed>)  (exhausted)
//!        └──────────────────────────────────────────────────────┘
//! ```
//!
//! Backoff before attempt `n + 1` is `backoff_ms * backoff_factor^(n - 1)`,
//! capped at `max_backoff_ms`, with equal jitter: half of the delay is fixed
//! and the other half is drawn uniformly at random.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::Rng;

use super::state::{AttemptResult, Delivered, Delivery, Failed, FailureReason, Ready};
use crate::config::PipelineConfig;
use crate::domain::record::FileRecord;
use crate::sink::RecordSink;
use crate::telemetry::{ATTEMPT_DURATION_SECONDS, ATTEMPT_FAILURES_TOTAL, RETRY_DENIED_TOTAL};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts allowed per record, including the first one
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
    /// Randomize half of each backoff delay
    pub jitter: bool,
}

impl From<&PipelineConfig> for RetryConfig {
    fn from(config: &PipelineConfig) -> Self {
        RetryConfig {
            max_attempts: config.max_delivery_attempts,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
            jitter: config.backoff_jitter,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay after `attempts` attempts have been made.
    pub fn base_backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(exponent));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Delay to sleep before the next attempt.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = self.base_backoff(attempts).as_millis() as u64;
        if !self.jitter || base < 2 {
            return Duration::from_millis(base);
        }
        let half = base / 2;
        let jitter = rand::thread_rng().gen_range(0..=base - half);
        Duration::from_millis(half + jitter)
    }
}

impl Delivery<Ready> {
    /// Start the delivery loop for a freshly accepted record.
    pub fn new(record: FileRecord) -> Self {
        Delivery {
            record,
            state: Ready {
                attempts: 0,
                last_error: None,
            },
        }
    }

    /// Make one attempt against the sink.
    ///
    /// The sink call runs in its own task so a panicking sink surfaces as a
    /// [`FailureReason::Panicked`] instead of taking the worker down. An
    /// attempt exceeding `timeout_ms` is aborted and reported as a timeout.
    pub async fn attempt<K: RecordSink + 'static>(
        self,
        sink: Arc<K>,
        timeout_ms: u64,
    ) -> AttemptResult {
        let attempts = self.state.attempts + 1;
        let record = self.record.clone();
        let started = Instant::now();

        tracing::debug!(
            record_id = %self.record.id,
            row_index = self.record.row_index,
            attempt = attempts,
            "Delivering record"
        );

        let task = tokio::spawn(async move { sink.deliver(&record).await });
        // Also fires if this future is dropped mid-attempt (worker aborted)
        let _abort_on_exit = scopeguard::guard(task.abort_handle(), |handle| handle.abort());

        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(sink_error))) => Err(FailureReason::from(sink_error)),
            Ok(Err(join_error)) => Err(FailureReason::Panicked {
                error: join_error.to_string(),
            }),
            Err(_) => Err(FailureReason::Timeout { timeout_ms }),
        };

        histogram!(ATTEMPT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => AttemptResult::Delivered(Delivery {
                record: self.record,
                state: Delivered {
                    attempts,
                    last_error: self.state.last_error,
                    delivered_at: chrono::Utc::now(),
                },
            }),
            Err(reason) => {
                counter!(
                    ATTEMPT_FAILURES_TOTAL,
                    "retriable" => if reason.is_retriable() { "true" } else { "false" }
                )
                .increment(1);
                AttemptResult::Failed(Delivery {
                    record: self.record,
                    state: Failed {
                        attempts,
                        reason,
                        failed_at: chrono::Utc::now(),
                    },
                })
            }
        }
    }
}

impl Delivery<Failed> {
    /// Attempt to schedule another delivery.
    ///
    /// Returns the record back in `Ready` together with the delay to wait
    /// before attempting it. Returns the failed delivery unchanged when the
    /// failure is not retriable or `max_attempts` has been reached.
    pub fn retry(
        self,
        config: &RetryConfig,
    ) -> std::result::Result<(Delivery<Ready>, Duration), Box<Self>> {
        if !self.state.reason.is_retriable() {
            tracing::debug!(
                record_id = %self.record.id,
                error = %self.state.reason.to_error_message(),
                "Failure is not retriable"
            );
            return Err(Box::new(self));
        }

        if self.state.attempts >= config.max_attempts {
            counter!(RETRY_DENIED_TOTAL, "reason" => "max_attempts").increment(1);
            tracing::debug!(
                record_id = %self.record.id,
                attempts = self.state.attempts,
                max_attempts = config.max_attempts,
                "No attempts remaining, record stays failed"
            );
            return Err(Box::new(self));
        }

        let backoff = config.backoff(self.state.attempts);

        tracing::info!(
            record_id = %self.record.id,
            next_attempt = self.state.attempts + 1,
            backoff_ms = backoff.as_millis() as u64,
            error = %self.state.reason.to_error_message(),
            "Retrying failed delivery with exponential backoff"
        );

        let ready = Delivery {
            record: self.record,
            state: Ready {
                attempts: self.state.attempts,
                last_error: Some(self.state.reason),
            },
        };
        Ok((ready, backoff))
    }
}
