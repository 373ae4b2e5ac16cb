//! Pipeline configuration.
//!
//! Durations are integer milliseconds, matching how they appear in config
//! files and environment variables. `PipelineConfig::load` layers, lowest
//! precedence first: built-in defaults, an optional config file (format
//! inferred from its extension), then `HOPPER__*` environment variables
//! (e.g. `HOPPER__QUEUE_CAPACITY=256`, `HOPPER__COLUMNS__FILE_TYPE=kind`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HopperError, Result};
use crate::parser::DEFAULT_MAX_SPREADSHEET_BYTES;

/// Explicit mapping from record fields to header names in the bulk input.
///
/// Columns are always resolved by name; their position in the file is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub file_type: String,
    pub size_bytes: String,
    pub filename: String,
    pub document_name: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            file_type: "file_type".to_string(),
            size_bytes: "file_size".to_string(),
            filename: "file_name".to_string(),
            document_name: "document_name".to_string(),
        }
    }
}

impl ColumnMapping {
    /// (field, header) pairs, in record field order.
    pub fn columns(&self) -> [(&'static str, &str); 4] {
        [
            ("file_type", self.file_type.as_str()),
            ("size_bytes", self.size_bytes.as_str()),
            ("filename", self.filename.as_str()),
            ("document_name", self.document_name.as_str()),
        ]
    }
}

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest accepted file size per record
    pub max_record_size_bytes: u64,

    /// File type tags accepted by the validator (compared case-insensitively)
    pub allowed_file_types: Vec<String>,

    /// Capacity of the dispatch queue between parser and workers
    pub queue_capacity: usize,

    /// Number of delivery workers per batch
    pub worker_pool_size: usize,

    /// Attempts per record, including the first one
    pub max_delivery_attempts: u32,

    /// Base backoff duration in milliseconds (exponentially increased per attempt)
    pub backoff_ms: u64,

    /// Factor by which the backoff grows with each attempt
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Randomize half of each backoff delay
    pub backoff_jitter: bool,

    /// Timeout for each individual sink call in milliseconds
    pub attempt_timeout_ms: u64,

    /// Give up enqueueing a record after this long on a full queue.
    /// None waits as long as the batch is running.
    pub enqueue_timeout_ms: Option<u64>,

    /// Overall budget for a batch, from start to report
    pub batch_deadline_ms: u64,

    /// Rolling dedup window shared across batches.
    /// None scopes deduplication to a single batch.
    pub dedup_window_ms: Option<u64>,

    /// How long in-flight attempts may finish after cancellation or timeout
    pub drain_grace_ms: u64,

    /// Interval for logging batch progress. None disables it.
    pub status_log_interval_ms: Option<u64>,

    /// Largest Excel upload buffered for parsing
    pub max_spreadsheet_bytes: u64,

    /// Header names for each record field
    pub columns: ColumnMapping,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_record_size_bytes: 10 * 1024 * 1024, // 10 MiB
            allowed_file_types: ["pdf", "docx", "doc", "xlsx", "csv", "txt", "png", "jpg", "jpeg"]
                .into_iter()
                .map(String::from)
                .collect(),
            queue_capacity: 1024,
            worker_pool_size: 8,
            max_delivery_attempts: 3,
            backoff_ms: 200,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
            backoff_jitter: true,
            attempt_timeout_ms: 30_000,
            enqueue_timeout_ms: None,
            batch_deadline_ms: 600_000, // 10 minutes
            dedup_window_ms: None,
            drain_grace_ms: 5_000,
            status_log_interval_ms: None,
            max_spreadsheet_bytes: DEFAULT_MAX_SPREADSHEET_BYTES,
            columns: ColumnMapping::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("HOPPER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("allowed_file_types")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(?config, "Loaded pipeline configuration");
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HopperError::Config(msg.to_string()));

        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.worker_pool_size == 0 {
            return invalid("worker_pool_size must be at least 1");
        }
        if self.max_delivery_attempts == 0 {
            return invalid("max_delivery_attempts must be at least 1");
        }
        if self.max_record_size_bytes == 0 {
            return invalid("max_record_size_bytes must be positive");
        }
        if self.max_spreadsheet_bytes == 0 {
            return invalid("max_spreadsheet_bytes must be positive");
        }
        if self.attempt_timeout_ms == 0 {
            return invalid("attempt_timeout_ms must be positive");
        }
        if self.status_log_interval_ms == Some(0) {
            return invalid("status_log_interval_ms must be positive when set");
        }
        if self.allowed_file_types.iter().all(|t| t.trim().is_empty()) {
            return invalid("allowed_file_types must name at least one type");
        }
        if let Some((field, _)) = self
            .columns
            .columns()
            .into_iter()
            .find(|(_, header)| header.trim().is_empty())
        {
            return Err(HopperError::Config(format!(
                "column mapping for '{}' is empty",
                field
            )));
        }
        Ok(())
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_ms.map(Duration::from_millis)
    }

    pub fn dedup_window(&self) -> Option<Duration> {
        self.dedup_window_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_record_size_bytes, 10_485_760);
        assert_eq!(config.max_delivery_attempts, 3);
        assert!(config.dedup_window().is_none());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let cases = [
            PipelineConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            PipelineConfig {
                worker_pool_size: 0,
                ..Default::default()
            },
            PipelineConfig {
                max_delivery_attempts: 0,
                ..Default::default()
            },
            PipelineConfig {
                status_log_interval_ms: Some(0),
                ..Default::default()
            },
            PipelineConfig {
                max_spreadsheet_bytes: 0,
                ..Default::default()
            },
            PipelineConfig {
                allowed_file_types: vec![" ".to_string()],
                ..Default::default()
            },
            PipelineConfig {
                columns: ColumnMapping {
                    filename: "".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(HopperError::Config(_))),
                "expected invalid: {:?}",
                config
            );
        }
    }

    #[test]
    #[serial]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
queue_capacity = 16
worker_pool_size = 2
allowed_file_types = ["pdf"]
dedup_window_ms = 60000

[columns]
file_type = "kind"
"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.allowed_file_types, vec!["pdf".to_string()]);
        assert_eq!(config.dedup_window(), Some(Duration::from_secs(60)));
        assert_eq!(config.columns.file_type, "kind");
        // Untouched fields keep their defaults
        assert_eq!(config.columns.filename, "file_name");
        assert_eq!(config.max_delivery_attempts, 3);
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "worker_pool_size = 0").unwrap();
        assert!(matches!(
            PipelineConfig::load(Some(file.path())),
            Err(HopperError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        const VARS: [(&str, &str); 4] = [
            ("HOPPER__QUEUE_CAPACITY", "32"),
            ("HOPPER__ALLOWED_FILE_TYPES", "pdf,png,csv"),
            ("HOPPER__COLUMNS__FILE_TYPE", "type_of_file"),
            ("HOPPER__ENQUEUE_TIMEOUT_MS", "250"),
        ];

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
queue_capacity = 16
worker_pool_size = 2
allowed_file_types = ["pdf"]

[columns]
file_type = "kind"
"#
        )
        .unwrap();

        for (key, value) in VARS {
            // SAFETY: tests touching the environment are serialized
            unsafe { std::env::set_var(key, value) };
        }
        let loaded = PipelineConfig::load(Some(file.path()));
        for (key, _) in VARS {
            unsafe { std::env::remove_var(key) };
        }

        let config = loaded.unwrap();
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(
            config.allowed_file_types,
            vec!["pdf".to_string(), "png".to_string(), "csv".to_string()]
        );
        assert_eq!(config.columns.file_type, "type_of_file");
        assert_eq!(config.enqueue_timeout(), Some(Duration::from_millis(250)));
        // File values without an override survive
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.columns.document_name, "document_name");
    }
}
