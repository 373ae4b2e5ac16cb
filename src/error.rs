//! Error types for the ingestion pipeline.
//!
//! Per-row and per-record problems (parse errors, rejections, duplicates,
//! delivery failures) are not errors at this level: they are typed outcomes
//! that end up in the [`BatchReport`](crate::BatchReport). `HopperError` covers
//! the fallible setup paths around a batch (format resolution, configuration,
//! sink construction) and the low-level causes they wrap.

use thiserror::Error;

/// Result type alias using the hopper error type.
pub type Result<T> = std::result::Result<T, HopperError>;

/// Main error type for the ingestion pipeline.
#[derive(Error, Debug)]
pub enum HopperError {
    /// The declared input format cannot be parsed (e.g. legacy `.xls` workbooks)
    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    /// A column named in the column mapping is absent from the header row
    #[error("Missing required column '{0}' in header row")]
    MissingColumn(String),

    /// The input stream could not be read any further
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// The dispatch queue was closed before the record could be enqueued
    #[error("Dispatch queue is closed")]
    QueueClosed,

    /// The dispatch queue stayed full for longer than the enqueue timeout
    #[error("Timed out after {0}ms waiting for dispatch queue capacity")]
    EnqueueTimeout(u64),

    /// Invalid pipeline configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reader error
    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    /// Excel workbook could not be opened or read
    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::XlsxError),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<::config::ConfigError> for HopperError {
    fn from(err: ::config::ConfigError) -> Self {
        HopperError::Config(err.to_string())
    }
}
