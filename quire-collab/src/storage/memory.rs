//! In-memory version log, used when no storage path is configured and in tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{advance, LogError, VersionLog};
use crate::model::{Document, DocumentId, Operation, Snapshot, VersionEntry};

struct DocumentLog {
    document: Document,
    entries: Vec<VersionEntry>,
    snapshot: Option<Snapshot>,
}

/// Version log held in process memory.
///
/// The outer map lock is only taken to find a document's slot; appends and
/// reads then lock that slot alone.
#[derive(Default)]
pub struct MemoryLog {
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<DocumentLog>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: DocumentId) -> Result<Arc<Mutex<DocumentLog>>, LogError> {
        self.documents
            .read()
            .get(&id)
            .cloned()
            .ok_or(LogError::DocumentNotFound(id))
    }
}

impl VersionLog for MemoryLog {
    fn create_document(&self, mut document: Document, genesis: Operation) -> Result<VersionEntry, LogError> {
        let mut documents = self.documents.write();
        if documents.contains_key(&document.id) {
            return Err(LogError::DocumentExists(document.id));
        }
        document.version = 0;
        document.length = 0;
        let entry = advance(&mut document, genesis, 0)?;
        documents.insert(
            document.id,
            Arc::new(Mutex::new(DocumentLog {
                document,
                entries: vec![entry.clone()],
                snapshot: None,
            })),
        );
        Ok(entry)
    }

    fn document(&self, id: DocumentId) -> Result<Document, LogError> {
        Ok(self.slot(id)?.lock().document.clone())
    }

    fn list_documents(&self) -> Result<Vec<Document>, LogError> {
        let slots: Vec<_> = self.documents.read().values().cloned().collect();
        let mut documents: Vec<Document> = slots.iter().map(|s| s.lock().document.clone()).collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(documents)
    }

    fn append(&self, operation: Operation, expected_version: u64) -> Result<VersionEntry, LogError> {
        let slot = self.slot(operation.document)?;
        let mut log = slot.lock();
        let entry = advance(&mut log.document, operation, expected_version)?;
        log.entries.push(entry.clone());
        Ok(entry)
    }

    fn entries_since(&self, id: DocumentId, version: u64) -> Result<Vec<VersionEntry>, LogError> {
        let slot = self.slot(id)?;
        let log = slot.lock();
        let from = (version as usize).min(log.entries.len());
        Ok(log.entries[from..].to_vec())
    }

    fn entry(&self, id: DocumentId, version: u64) -> Result<Option<VersionEntry>, LogError> {
        let slot = self.slot(id)?;
        let log = slot.lock();
        Ok(version
            .checked_sub(1)
            .and_then(|i| log.entries.get(i as usize))
            .cloned())
    }

    fn load_snapshot(&self, id: DocumentId) -> Result<Option<Snapshot>, LogError> {
        Ok(self.slot(id)?.lock().snapshot.clone())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LogError> {
        self.slot(snapshot.document)?.lock().snapshot = Some(snapshot.clone());
        Ok(())
    }
}
