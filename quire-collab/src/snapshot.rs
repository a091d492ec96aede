//! Materialised document bodies.
//!
//! ```text
//!   persisted cache ──load──► Body { rope, version } ◄──fold── entries_since(version)
//!   (snapshots CF)  ◄─persist── every N versions
//! ```
//!
//! The cache is derived data. Any mismatch between a folded body and the
//! length recorded in the log discards it and replays from version 1.
//! At most `max_cached_bodies` bodies stay in memory; the least recently
//! read one is dropped first and reloaded on demand.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use ropey::Rope;

use crate::config::SnapshotConfig;
use crate::error::CollabError;
use crate::model::{DocumentId, Snapshot, VersionEntry};
use crate::sequencer::AcceptListener;
use crate::storage::VersionLog;

/// A materialised document body.
struct Body {
    rope: Rope,
    /// Version the rope reflects.
    version: u64,
    /// Newest version written to the persisted cache.
    persisted_version: u64,
}

impl Body {
    fn empty() -> Self {
        Self {
            rope: Rope::new(),
            version: 0,
            persisted_version: 0,
        }
    }

    /// Apply one entry; false if it does not line up with the body.
    fn fold(&mut self, entry: &VersionEntry) -> bool {
        if entry.version != self.version + 1 {
            return false;
        }
        if quire_ot::apply_to_rope(&mut self.rope, &entry.operation.components).is_err() {
            return false;
        }
        self.version = entry.version;
        self.rope.len_chars() == entry.result_len
    }
}

type BodySlot = Arc<Mutex<Option<Body>>>;

/// Serves `(content, version)` snapshots from bodies folded out of the
/// version log.
pub struct SnapshotManager {
    log: Arc<dyn VersionLog>,
    /// Persist every N versions (0 never persists outside `rebuild`).
    persist_interval: u64,
    /// Loaded bodies, least recently read evicted first.
    bodies: Mutex<LruCache<DocumentId, BodySlot>>,
}

impl SnapshotManager {
    /// Create a manager reading from `log`. Nothing is loaded until the
    /// first snapshot of a document is requested.
    pub fn new(log: Arc<dyn VersionLog>, config: &SnapshotConfig) -> Self {
        let bodies = match NonZeroUsize::new(config.max_cached_bodies) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            log,
            persist_interval: config.persist_interval,
            bodies: Mutex::new(bodies),
        }
    }

    /// Current content and the version it reflects.
    ///
    /// Starts from the in-memory body, else from the persisted cache, else
    /// from an empty document, and folds every newer log entry into it.
    pub fn snapshot(&self, document: DocumentId) -> Result<Snapshot, CollabError> {
        let slot = self.slot(document);
        let mut guard = slot.lock();

        let body = match guard.take() {
            Some(body) => body,
            None => self.load(document)?,
        };
        let body = self.catch_up(document, body)?;
        let snapshot = Snapshot {
            document,
            version: body.version,
            content: body.rope.to_string(),
        };
        *guard = Some(body);
        Ok(snapshot)
    }

    /// Discard the cache and replay the whole log, then persist the result.
    pub fn rebuild(&self, document: DocumentId) -> Result<Snapshot, CollabError> {
        let slot = self.slot(document);
        let mut guard = slot.lock();
        guard.take();

        let mut body = self.replay(document)?;
        self.persist(document, &mut body);
        let snapshot = Snapshot {
            document,
            version: body.version,
            content: body.rope.to_string(),
        };
        *guard = Some(body);
        Ok(snapshot)
    }

    /// Drop the in-memory body; the next snapshot reloads it.
    pub fn invalidate(&self, document: DocumentId) {
        self.bodies.lock().pop(&document);
    }

    /// Version of the in-memory body, if one is loaded.
    pub fn cached_version(&self, document: DocumentId) -> Option<u64> {
        let slot = self.loaded_slot(document)?;
        let guard = slot.lock();
        guard.as_ref().map(|b| b.version)
    }

    /// Number of documents with a body slot in memory.
    pub fn cached_documents(&self) -> usize {
        self.bodies.lock().len()
    }

    /// The slot of `document`, created if needed and marked as most
    /// recently used. May evict another document's body.
    fn slot(&self, document: DocumentId) -> BodySlot {
        let mut bodies = self.bodies.lock();
        if let Some(slot) = bodies.get(&document) {
            return slot.clone();
        }
        let slot = BodySlot::default();
        if let Some((evicted, _)) = bodies.push(document, slot.clone()) {
            log::debug!("Evicted snapshot body of {evicted}");
        }
        slot
    }

    /// The slot of `document` if present, without touching recency.
    fn loaded_slot(&self, document: DocumentId) -> Option<BodySlot> {
        self.bodies.lock().peek(&document).cloned()
    }

    /// Start from the persisted cache when it checks out, else from empty.
    fn load(&self, document: DocumentId) -> Result<Body, CollabError> {
        let Some(persisted) = self.log.load_snapshot(document)? else {
            return Ok(Body::empty());
        };

        let recorded = self.log.entry(document, persisted.version)?;
        let len = persisted.content.chars().count();
        match recorded {
            Some(entry) if entry.result_len == len => Ok(Body {
                rope: Rope::from_str(&persisted.content),
                version: persisted.version,
                persisted_version: persisted.version,
            }),
            _ => {
                log::warn!(
                    "Persisted snapshot of {document} at version {} is inconsistent, rebuilding",
                    persisted.version
                );
                Ok(Body::empty())
            }
        }
    }

    fn catch_up(&self, document: DocumentId, mut body: Body) -> Result<Body, CollabError> {
        let entries = self.log.entries_since(document, body.version)?;
        if entries.is_empty() {
            return Ok(body);
        }
        for entry in &entries {
            if !body.fold(entry) {
                log::warn!(
                    "Snapshot of {document} diverged at version {}, rebuilding from version 1",
                    entry.version
                );
                let mut rebuilt = self.replay(document)?;
                self.persist(document, &mut rebuilt);
                return Ok(rebuilt);
            }
        }
        self.maybe_persist(document, &mut body);
        Ok(body)
    }

    fn replay(&self, document: DocumentId) -> Result<Body, CollabError> {
        let mut body = Body::empty();
        for entry in self.log.entries_since(document, 0)? {
            if !body.fold(&entry) {
                return Err(CollabError::storage(format!(
                    "log of {document} does not replay at version {}",
                    entry.version
                )));
            }
        }
        Ok(body)
    }

    fn maybe_persist(&self, document: DocumentId, body: &mut Body) {
        if self.persist_interval > 0 && body.version >= body.persisted_version + self.persist_interval {
            self.persist(document, body);
        }
    }

    fn persist(&self, document: DocumentId, body: &mut Body) {
        let snapshot = Snapshot {
            document,
            version: body.version,
            content: body.rope.to_string(),
        };
        match self.log.save_snapshot(&snapshot) {
            Ok(()) => {
                body.persisted_version = body.version;
                log::debug!("Persisted snapshot of {document} at version {}", body.version);
            }
            Err(e) => log::error!("Failed to persist snapshot of {document}: {e}"),
        }
    }
}

impl AcceptListener for SnapshotManager {
    /// Fold the new entry into a loaded body; unloaded bodies stay lazy.
    fn on_accepted(&self, entry: &VersionEntry) {
        let Some(slot) = self.loaded_slot(entry.document) else {
            return;
        };
        let mut guard = slot.lock();
        let Some(body) = guard.as_mut() else {
            return;
        };
        if body.version >= entry.version {
            return;
        }
        if body.fold(entry) {
            self.maybe_persist(entry.document, body);
        } else {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Document, Operation};
    use crate::storage::MemoryLog;
    use quire_ot::TextOperation;
    use uuid::Uuid;

    fn setup(content: &str, persist_interval: u64) -> (Arc<MemoryLog>, SnapshotManager, Document) {
        let log = Arc::new(MemoryLog::new());
        let owner = Uuid::new_v4();
        let doc = Document::new(owner, "snap", false);
        let id = doc.id;
        log.create_document(doc, Operation::new(id, owner, 0, TextOperation::insert_at(0, 0, content).unwrap()))
            .unwrap();
        let manager = SnapshotManager::new(
            log.clone(),
            &SnapshotConfig {
                persist_interval,
                ..SnapshotConfig::default()
            },
        );
        let doc = log.document(id).unwrap();
        (log, manager, doc)
    }

    fn append(log: &MemoryLog, doc: DocumentId, pos: usize, text: &str) -> VersionEntry {
        let current = log.document(doc).unwrap();
        let op = TextOperation::insert_at(current.length, pos, text).unwrap();
        log.append(Operation::new(doc, Uuid::new_v4(), current.version, op), current.version)
            .unwrap()
    }

    #[test]
    fn test_snapshot_folds_lazily() {
        let (log, manager, doc) = setup("Hello", 0);
        assert_eq!(manager.cached_version(doc.id), None);

        append(&log, doc.id, 5, ", world");
        let snap = manager.snapshot(doc.id).unwrap();
        assert_eq!(snap.version, 2);
        assert_eq!(snap.content, "Hello, world");
        assert_eq!(manager.cached_version(doc.id), Some(2));
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let (log, manager, doc) = setup("abc", 0);
        append(&log, doc.id, 0, "x");
        let first = manager.snapshot(doc.id).unwrap();
        let second = manager.snapshot(doc.id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_on_accepted_folds_loaded_body() {
        let (log, manager, doc) = setup("abc", 0);
        manager.snapshot(doc.id).unwrap();

        let entry = append(&log, doc.id, 3, "d");
        manager.on_accepted(&entry);
        assert_eq!(manager.cached_version(doc.id), Some(2));
        assert_eq!(manager.snapshot(doc.id).unwrap().content, "abcd");
    }

    #[test]
    fn test_persists_every_interval() {
        let (log, manager, doc) = setup("", 3);
        for i in 0..3 {
            append(&log, doc.id, i, "z");
        }
        manager.snapshot(doc.id).unwrap();

        let persisted = log.load_snapshot(doc.id).unwrap().unwrap();
        assert_eq!(persisted.version, 4);
        assert_eq!(persisted.content, "zzz");
    }

    #[test]
    fn test_starts_from_persisted_cache() {
        let (log, manager, doc) = setup("Hello", 0);
        append(&log, doc.id, 5, "!");
        manager.rebuild(doc.id).unwrap();
        append(&log, doc.id, 0, ">");

        let fresh = SnapshotManager::new(
            log.clone(),
            &SnapshotConfig {
                persist_interval: 0,
                ..SnapshotConfig::default()
            },
        );
        let snap = fresh.snapshot(doc.id).unwrap();
        assert_eq!(snap.content, ">Hello!");
        assert_eq!(snap.version, 3);
    }

    #[test]
    fn test_inconsistent_persisted_cache_is_rebuilt() {
        let (log, manager, doc) = setup("Hello", 0);
        log.save_snapshot(&Snapshot {
            document: doc.id,
            version: 1,
            content: "Hello there".into(),
        })
        .unwrap();

        let snap = manager.snapshot(doc.id).unwrap();
        assert_eq!(snap.content, "Hello");
    }

    #[test]
    fn test_invalidate_and_rebuild_agree() {
        let (log, manager, doc) = setup("one", 0);
        append(&log, doc.id, 3, " two");
        let before = manager.snapshot(doc.id).unwrap();

        manager.invalidate(doc.id);
        assert_eq!(manager.cached_version(doc.id), None);
        assert_eq!(manager.snapshot(doc.id).unwrap(), before);
        assert_eq!(manager.rebuild(doc.id).unwrap(), before);
        assert_eq!(log.load_snapshot(doc.id).unwrap().map(|s| s.version), Some(2));
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let (log, _manager, first) = setup("one", 0);
        let manager = SnapshotManager::new(
            log.clone(),
            &SnapshotConfig {
                persist_interval: 0,
                max_cached_bodies: 2,
            },
        );
        let owner = Uuid::new_v4();
        let mut others = Vec::new();
        for content in ["two", "three"] {
            let doc = Document::new(owner, content, false);
            let id = doc.id;
            log.create_document(doc, Operation::new(id, owner, 0, TextOperation::insert_at(0, 0, content).unwrap()))
                .unwrap();
            others.push(id);
        }
        let (second, third) = (others[0], others[1]);

        manager.snapshot(first.id).unwrap();
        manager.snapshot(second).unwrap();
        manager.snapshot(first.id).unwrap();
        manager.snapshot(third).unwrap();

        assert_eq!(manager.cached_documents(), 2);
        assert_eq!(manager.cached_version(second), None);
        assert_eq!(manager.cached_version(first.id), Some(1));
        assert_eq!(manager.cached_version(third), Some(1));

        // Evicted bodies reload on demand.
        assert_eq!(manager.snapshot(second).unwrap().content, "two");
        assert_eq!(manager.cached_documents(), 2);
        assert_eq!(manager.cached_version(first.id), None);
    }

    #[test]
    fn test_unknown_document() {
        let (_log, manager, _doc) = setup("", 0);
        let id = Uuid::new_v4();
        assert_eq!(manager.snapshot(id), Err(CollabError::DocumentNotFound(id)));
    }
}
