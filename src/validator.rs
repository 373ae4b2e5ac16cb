//! Per-record validation.
//!
//! Rules are checked in order and the first failure wins:
//! 1. the file type is on the allow-list;
//! 2. the size is positive and within the configured maximum;
//! 3. filename and document name are present and free of path traversal.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::domain::record::FileRecord;

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("file type '{file_type}' is not allowed")]
    DisallowedFileType { file_type: String },

    #[error("file size must be greater than zero")]
    EmptyFile,

    #[error("file size {size_bytes} exceeds the maximum of {max_bytes} bytes")]
    TooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("filename is empty")]
    MissingFilename,

    #[error("document name is empty")]
    MissingDocumentName,

    #[error("{field} contains a path traversal sequence")]
    PathTraversal { field: &'static str },
}

/// Result of validating one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    Rejected(RejectionReason),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted)
    }
}

/// Stateless record validator; safe to share across tasks.
#[derive(Debug, Clone)]
pub struct Validator {
    allowed_file_types: HashSet<String>,
    max_record_size_bytes: u64,
}

impl Validator {
    pub fn new<I, S>(allowed_file_types: I, max_record_size_bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_file_types: allowed_file_types
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            max_record_size_bytes,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.allowed_file_types, config.max_record_size_bytes)
    }

    pub fn validate(&self, record: &FileRecord) -> ValidationOutcome {
        match self.check(record) {
            Ok(()) => ValidationOutcome::Accepted,
            Err(reason) => ValidationOutcome::Rejected(reason),
        }
    }

    fn check(&self, record: &FileRecord) -> Result<(), RejectionReason> {
        let file_type = record.file_type.trim().to_lowercase();
        if !self.allowed_file_types.contains(&file_type) {
            return Err(RejectionReason::DisallowedFileType {
                file_type: record.file_type.clone(),
            });
        }

        if record.size_bytes == 0 {
            return Err(RejectionReason::EmptyFile);
        }
        if record.size_bytes > self.max_record_size_bytes {
            return Err(RejectionReason::TooLarge {
                size_bytes: record.size_bytes,
                max_bytes: self.max_record_size_bytes,
            });
        }

        if record.filename.trim().is_empty() {
            return Err(RejectionReason::MissingFilename);
        }
        if record.document_name.trim().is_empty() {
            return Err(RejectionReason::MissingDocumentName);
        }
        if has_path_traversal(&record.filename) {
            return Err(RejectionReason::PathTraversal { field: "filename" });
        }
        if has_path_traversal(&record.document_name) {
            return Err(RejectionReason::PathTraversal {
                field: "document name",
            });
        }

        Ok(())
    }
}

/// Absolute paths, drive prefixes, NUL bytes and `..` components all count.
fn has_path_traversal(name: &str) -> bool {
    let name = name.trim();
    if name.contains('\0') || name.starts_with('/') || name.starts_with('\\') {
        return true;
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    name.split(['/', '\\']).any(|component| component == "..")
}
