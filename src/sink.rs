//! Sink abstraction for handing accepted records downstream.
//!
//! This module defines the `RecordSink` trait, the single egress capability
//! the pipeline depends on. The concrete transport is pluggable: `HttpSink`
//! posts a JSON envelope to a metadata endpoint, and `MockSink` scripts
//! responses for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::record::{FileRecord, RecordId};
use crate::error::Result;

/// Failure reported by a sink for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Temporary problem (unavailable, throttled, timed out); may succeed on retry
    #[error("transient: {0}")]
    Transient(String),

    /// The sink refused the record; retrying will not help
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Result of a single delivery.
pub type SinkResult = std::result::Result<(), SinkError>;

/// Trait for delivering records to the downstream system.
///
/// Implementations must be safe to call concurrently from every delivery
/// worker. A call should not retry internally: the worker owns the retry
/// policy and needs to see each transient failure.
///
/// # Example
/// ```ignore
/// let sink = HttpSink::new(HttpSinkConfig::new("http://metadata:8000/save-metadata"))?;
/// sink.deliver(&record).await?;
/// ```
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one record.
    async fn deliver(&self, record: &FileRecord) -> SinkResult;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Message body sent downstream for each record.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEnvelope<'a> {
    pub document_id: RecordId,
    pub file_name: &'a str,
    pub file_size: u64,
    pub file_type: &'a str,
    pub document_name: &'a str,
    pub fingerprint: &'a str,
    /// Lets the receiver drop redelivered messages
    pub idempotency_key: RecordId,
    pub source: &'a str,
    pub transaction_type: &'a str,
    pub bucket: &'a str,
}

impl<'a> DeliveryEnvelope<'a> {
    pub fn new(record: &'a FileRecord, config: &'a HttpSinkConfig) -> Self {
        Self {
            document_id: record.id,
            file_name: &record.filename,
            file_size: record.size_bytes,
            file_type: &record.file_type,
            document_name: &record.document_name,
            fingerprint: record.fingerprint.as_str(),
            idempotency_key: record.id,
            source: &config.source,
            transaction_type: "new",
            bucket: &config.bucket,
        }
    }
}

/// Settings for [`HttpSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSinkConfig {
    /// Full URL records are POSTed to
    pub endpoint: String,
    /// Sent as `Authorization: Bearer` when non-empty
    pub api_key: String,
    pub source: String,
    pub bucket: String,
    pub timeout_ms: u64,
}

impl HttpSinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: String::new(),
            source: "bulk-upload-service".to_string(),
            bucket: "documents".to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// Statuses worth retrying: server errors (5xx), rate limits (429) and timeouts (408).
pub fn is_retriable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Production sink posting each record as JSON over HTTP.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpSinkConfig {
        &self.config
    }
}

#[async_trait]
impl RecordSink for HttpSink {
    #[tracing::instrument(skip(self, record), fields(record_id = %record.id, row_index = record.row_index))]
    async fn deliver(&self, record: &FileRecord) -> SinkResult {
        let envelope = DeliveryEnvelope::new(record, &self.config);

        let mut request = self.client.post(&self.config.endpoint).json(&envelope);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(endpoint = %self.config.endpoint, error = %e, "Sink request failed");
            if e.is_builder() || e.is_redirect() {
                SinkError::Permanent(e.to_string())
            } else {
                // Connect errors, timeouts and broken bodies are worth another try
                SinkError::Transient(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            tracing::debug!(status, "Record delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("status {}: {}", status, body);
        if is_retriable_status(status) {
            Err(SinkError::Transient(message))
        } else {
            Err(SinkError::Permanent(message))
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock sink for testing.
///
/// Responses are scripted per filename and returned in FIFO order. Once a
/// filename's script runs out, the default response is used (`Ok(())` unless
/// changed with [`MockSink::set_default_response`]).
///
/// # Example
/// ```ignore
/// let mock = MockSink::new();
/// mock.add_response("report.pdf", Err(SinkError::Transient("busy".into())));
/// mock.add_response("report.pdf", Ok(()));
/// ```
#[derive(Clone, Default)]
pub struct MockSink {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    default_response: Arc<Mutex<Option<SinkResult>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    /// Immediate response
    Immediate(SinkResult),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: SinkResult,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub record_id: RecordId,
    pub filename: String,
    pub fingerprint: String,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next delivery of `filename`.
    pub fn add_response(&self, filename: &str, response: SinkResult) {
        self.responses
            .lock()
            .entry(filename.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue a response that blocks until the returned sender fires (or is dropped).
    pub fn add_response_with_trigger(
        &self,
        filename: &str,
        response: SinkResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(filename.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Response used when nothing is scripted for a filename.
    pub fn set_default_response(&self, response: SinkResult) {
        *self.default_response.lock() = Some(response);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, filename: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.filename == filename)
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of deliveries currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MockSink {
    async fn deliver(&self, record: &FileRecord) -> SinkResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            record_id: record.id,
            filename: record.filename.clone(),
            fingerprint: record.fingerprint.as_str().to_string(),
        });

        let scripted = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&record.filename)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match scripted {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether the trigger fires or is dropped
                let _ = trigger.await;
                response
            }
            None => self.default_response.lock().clone().unwrap_or(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(filename: &str) -> FileRecord {
        FileRecord::new(1, "pdf", 2048, filename, "Quarterly report")
    }

    #[tokio::test]
    async fn test_mock_sink_scripted_responses() {
        let mock = MockSink::new();
        mock.add_response("a.pdf", Err(SinkError::Transient("busy".to_string())));
        mock.add_response("a.pdf", Ok(()));
        mock.set_default_response(Err(SinkError::Permanent("unknown".to_string())));

        assert!(mock.deliver(&record("a.pdf")).await.unwrap_err().is_transient());
        assert!(mock.deliver(&record("a.pdf")).await.is_ok());
        // Script exhausted: falls back to the default
        assert_eq!(
            mock.deliver(&record("a.pdf")).await,
            Err(SinkError::Permanent("unknown".to_string()))
        );
        assert_eq!(mock.calls_for("a.pdf"), 3);
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_sink_with_trigger() {
        let mock = MockSink::new();
        let trigger = mock.add_response_with_trigger("slow.pdf", Ok(()));

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move { mock_clone.deliver(&record("slow.pdf")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_http_sink_posts_envelope() {
        let server = MockServer::start().await;
        let record = record("report.pdf");

        Mock::given(method("POST"))
            .and(path("/save-metadata"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "file_name": "report.pdf",
                "file_size": 2048,
                "file_type": "pdf",
                "document_name": "Quarterly report",
                "idempotency_key": record.id,
                "transaction_type": "new",
                "bucket": "documents",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(HttpSinkConfig {
            api_key: "secret".to_string(),
            ..HttpSinkConfig::new(format!("{}/save-metadata", server.uri()))
        })
        .unwrap();

        sink.deliver(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_sink_classifies_statuses() {
        let server = MockServer::start().await;
        Mock::given(path("/unavailable"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;
        Mock::given(path("/throttled"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/malformed"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
            .mount(&server)
            .await;

        let sink_for = |route: &str| {
            HttpSink::new(HttpSinkConfig::new(format!("{}{}", server.uri(), route))).unwrap()
        };

        let err = sink_for("/unavailable")
            .deliver(&record("a.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err, SinkError::Transient("status 503: down".to_string()));

        let err = sink_for("/throttled")
            .deliver(&record("a.pdf"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = sink_for("/malformed")
            .deliver(&record("a.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err, SinkError::Permanent("status 422: bad payload".to_string()));
    }

    #[tokio::test]
    async fn test_http_sink_connection_failure_is_transient() {
        // Nothing listens on port 9 (discard) in test environments
        let sink = HttpSink::new(HttpSinkConfig {
            timeout_ms: 500,
            ..HttpSinkConfig::new("http://127.0.0.1:9/save-metadata")
        })
        .unwrap();
        let err = sink.deliver(&record("a.pdf")).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[test]
    fn test_retriable_statuses() {
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(429));
        assert!(is_retriable_status(408));
        assert!(!is_retriable_status(400));
        assert!(!is_retriable_status(404));
        assert!(!is_retriable_status(422));
    }
}
