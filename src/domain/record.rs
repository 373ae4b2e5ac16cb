//! File-metadata records flowing through the pipeline.
//!
//! A record is created once by the parser and then moved from stage to stage;
//! nothing mutates it after construction.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 1-based index of a data row in the bulk input (the header row is not counted).
pub type RowIndex = u64;

/// Unique identifier for a record (also used as the document id downstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RecordId {
    fn from(uuid: Uuid) -> Self {
        RecordId(uuid)
    }
}

impl std::ops::Deref for RecordId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Stable content fingerprint used for deduplication.
///
/// Lowercase hex SHA-256 over the normalized file type, the size and the
/// trimmed filename, so the same document described twice hashes the same
/// across processes and runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(file_type: &str, size_bytes: u64, filename: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_type.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(size_bytes.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(filename.trim().as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get(..12).unwrap_or(&self.0))
    }
}

/// Metadata describing one file in a bulk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Identifier assigned at parse time.
    pub id: RecordId,
    /// Position of the source row, for reporting.
    pub row_index: RowIndex,
    /// File type tag (e.g. "pdf").
    pub file_type: String,
    /// Declared size of the file in bytes.
    pub size_bytes: u64,
    /// Original filename as uploaded.
    pub filename: String,
    /// Human-readable document name.
    pub document_name: String,
    /// Derived from type, size and filename.
    pub fingerprint: Fingerprint,
}

impl FileRecord {
    pub fn new(
        row_index: RowIndex,
        file_type: impl Into<String>,
        size_bytes: u64,
        filename: impl Into<String>,
        document_name: impl Into<String>,
    ) -> Self {
        let file_type = file_type.into();
        let filename = filename.into();
        let fingerprint = Fingerprint::compute(&file_type, size_bytes, &filename);
        Self {
            id: RecordId::new(),
            row_index,
            file_type,
            size_bytes,
            filename,
            document_name: document_name.into(),
            fingerprint,
        }
    }
}
