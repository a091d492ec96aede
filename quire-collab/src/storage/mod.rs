//! Version log storage.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append(op, expected)  ┌──────────────────────┐
//! │  Sequencer  │ ─────────────────────► │ dyn VersionLog       │
//! └─────────────┘                        │                      │
//! ┌─────────────┐  entries_since(v)      │  MemoryLog           │
//! │ Snapshots,  │ ◄───────────────────── │  RocksLog (RocksDB)  │
//! │ sessions,   │                        └──────────┬───────────┘
//! │ comments    │                                   │ column families
//! └─────────────┘                                   ▼
//!                       ┌──────────────────────────────────────────┐
//!                       │ CF "documents"    document rows           │
//!                       │ CF "operations"   entries, doc ‖ version  │
//!                       │ CF "snapshots"    materialised content    │
//!                       └──────────────────────────────────────────┘
//! ```
//!
//! Every backend serialises appends per document and never holds a lock
//! across documents.

mod memory;
mod record;
mod rocks;

pub use memory::MemoryLog;
pub use record::{decode_record, encode_record};
pub use rocks::RocksLog;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{Document, DocumentId, Operation, Snapshot, VersionEntry};

/// Failures below the log contract: the database, encoding, compression
/// and integrity checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("checksum mismatch for record {key}")]
    Checksum { key: String },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Errors of the version log contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// `expected` no longer names the newest version.
    #[error("version conflict: expected {expected}, log is at {current}")]
    VersionConflict { expected: u64, current: u64 },

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("document already exists: {0}")]
    DocumentExists(Uuid),

    /// The operation does not cover the document's current length.
    #[error("operation expects {actual} characters but the document has {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Append-only, per-document ordered store of accepted operations.
///
/// Versions of a document always form the contiguous range `1..=version`.
pub trait VersionLog: Send + Sync {
    /// Write the document row and its genesis entry (version 1).
    fn create_document(&self, document: Document, genesis: Operation) -> Result<VersionEntry, LogError>;

    fn document(&self, id: DocumentId) -> Result<Document, LogError>;

    fn list_documents(&self) -> Result<Vec<Document>, LogError>;

    fn current_version(&self, id: DocumentId) -> Result<u64, LogError> {
        Ok(self.document(id)?.version)
    }

    /// Append iff `expected_version` is the newest version.
    fn append(&self, operation: Operation, expected_version: u64) -> Result<VersionEntry, LogError>;

    /// Entries with versions strictly greater than `version`, in order.
    fn entries_since(&self, id: DocumentId, version: u64) -> Result<Vec<VersionEntry>, LogError>;

    fn entry(&self, id: DocumentId, version: u64) -> Result<Option<VersionEntry>, LogError>;

    /// Document length after `version`; version 0 is the empty document.
    fn length_at(&self, id: DocumentId, version: u64) -> Result<Option<usize>, LogError> {
        if version == 0 {
            self.document(id)?;
            return Ok(Some(0));
        }
        Ok(self.entry(id, version)?.map(|e| e.result_len))
    }

    /// Persisted snapshot cache, if any.
    fn load_snapshot(&self, id: DocumentId) -> Result<Option<Snapshot>, LogError>;

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LogError>;
}

/// Check `operation` against the document row and advance the row.
///
/// Shared by the backends so both enforce the same append rules.
pub(crate) fn advance(
    document: &mut Document,
    operation: Operation,
    expected_version: u64,
) -> Result<VersionEntry, LogError> {
    if expected_version != document.version {
        return Err(LogError::VersionConflict {
            expected: expected_version,
            current: document.version,
        });
    }
    let base_len = operation.components.base_len();
    if base_len != document.length {
        return Err(LogError::LengthMismatch {
            expected: document.length,
            actual: base_len,
        });
    }

    let result_len = operation.components.target_len();
    document.version += 1;
    document.length = result_len;
    document.updated_at = operation.created_at;

    Ok(VersionEntry {
        document: document.id,
        version: document.version,
        operation,
        result_len,
    })
}

/// Outcome of an integrity walk over one document's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub document: DocumentId,
    pub entries: u64,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check version contiguity and that every entry's length chains onto the
/// previous one.
pub fn verify_document(log: &dyn VersionLog, id: DocumentId) -> Result<VerifyReport, LogError> {
    let document = log.document(id)?;
    let entries = log.entries_since(id, 0)?;
    let mut problems = Vec::new();
    let mut previous_len = 0;

    for (i, entry) in entries.iter().enumerate() {
        let expected = i as u64 + 1;
        if entry.version != expected {
            problems.push(format!("expected version {expected}, found {}", entry.version));
        }
        let op = &entry.operation.components;
        if op.base_len() != previous_len {
            problems.push(format!(
                "version {} applies to {} characters but version {} left {previous_len}",
                entry.version,
                op.base_len(),
                entry.version.saturating_sub(1)
            ));
        }
        if op.target_len() != entry.result_len {
            problems.push(format!(
                "version {} records length {} but produces {}",
                entry.version,
                entry.result_len,
                op.target_len()
            ));
        }
        previous_len = entry.result_len;
    }

    if entries.len() as u64 != document.version {
        problems.push(format!(
            "document row is at version {} but the log holds {} entries",
            document.version,
            entries.len()
        ));
    }
    if previous_len != document.length {
        problems.push(format!(
            "document row records length {} but the log ends at {previous_len}",
            document.length
        ));
    }

    Ok(VerifyReport {
        document: id,
        entries: entries.len() as u64,
        problems,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_ot::TextOperation;

    #[test]
    fn test_advance_checks_version_then_length() {
        let mut doc = Document::new(Uuid::new_v4(), "t", false);
        let genesis = Operation::new(doc.id, doc.owner, 0, TextOperation::insert_at(0, 0, "Hello").unwrap());

        let entry = advance(&mut doc, genesis, 0).unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.result_len, 5);
        assert_eq!(doc.length, 5);

        let stale = Operation::new(doc.id, doc.owner, 0, TextOperation::identity(5));
        assert_eq!(
            advance(&mut doc, stale, 0),
            Err(LogError::VersionConflict { expected: 0, current: 1 })
        );

        let wrong_len = Operation::new(doc.id, doc.owner, 1, TextOperation::identity(3));
        assert_eq!(
            advance(&mut doc, wrong_len, 1),
            Err(LogError::LengthMismatch { expected: 5, actual: 3 })
        );
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_verify_clean_log() {
        let log = MemoryLog::new();
        let owner = Uuid::new_v4();
        let doc = Document::new(owner, "t", false);
        let id = doc.id;
        log.create_document(doc, Operation::new(id, owner, 0, TextOperation::insert_at(0, 0, "ab").unwrap()))
            .unwrap();
        log.append(Operation::new(id, owner, 1, TextOperation::insert_at(2, 2, "c").unwrap()), 1)
            .unwrap();

        let report = verify_document(&log, id).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.entries, 2);
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::Checksum { key: "abc".into() }.to_string(),
            "checksum mismatch for record abc"
        );
        let e: LogError = StoreError::Database("boom".into()).into();
        assert_eq!(e.to_string(), "database error: boom");
    }
}
