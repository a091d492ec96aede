//! RocksDB-backed version log.
//!
//! Column families:
//! - `documents` : document rows, keyed by doc_id
//! - `operations`: version entries, keyed `doc_id:16 ‖ version:8 BE`
//! - `snapshots` : the snapshot manager's persisted cache, keyed by doc_id
//!
//! Values are framed by [`encode_record`]: bincode, LZ4 and a checksum.
//! An append writes the entry and the advanced document row in one
//! `WriteBatch`, so a crash never leaves a gap or a row ahead of its log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use uuid::Uuid;

use super::record::{decode_record, encode_record};
use super::{advance, LogError, StoreError, VersionLog};
use crate::config::StorageConfig;
use crate::model::{Document, DocumentId, Operation, Snapshot, VersionEntry};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS, CF_SNAPSHOTS];

/// Durable version log.
///
/// Appends to one document are serialised by a per-document lock; the
/// document row and the new entry land in a single `WriteBatch`.
pub struct RocksLog {
    /// Database handle with the three column families open
    db: DBWithThreadMode<SingleThreaded>,
    /// Directory the database lives in
    path: PathBuf,
    /// fsync every write batch
    sync_writes: bool,
    /// Per-document append locks; the map lock is held only for lookup.
    locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl RocksLog {
    /// Open (or create) the log at `path`.
    ///
    /// Missing column families are created. Cache, bloom filter and write
    /// buffer sizes come from `config`; `config.path` is ignored in favour
    /// of `path`.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &path, cf_descriptors)
            .map_err(StoreError::from)?;

        let log = Self {
            db,
            path,
            sync_writes: config.sync_writes,
            locks: Mutex::new(HashMap::new()),
        };
        let count = log.document_count()?;
        log::info!("Opened version log at {} ({count} documents)", log.path.display());
        Ok(log)
    }

    /// Per-column-family tuning: point lookups for rows and snapshots,
    /// prefix scans for operations.
    fn cf_options(name: &str, config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Records are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Directory the database was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force memtables to disk.
    ///
    /// Appends are already durable when `sync_writes` is set; this is for
    /// tools that exit right after writing.
    pub fn flush(&self) -> Result<(), LogError> {
        self.db.flush().map_err(StoreError::from)?;
        Ok(())
    }

    /// Documents in the `documents` column family, for the open log line.
    fn document_count(&self) -> Result<usize, LogError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(StoreError::from)?;
            count += 1;
        }
        Ok(count)
    }

    /// The append lock of `id`, created on first use.
    fn lock_for(&self, id: DocumentId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    fn load_document(&self, id: DocumentId) -> Result<Option<Document>, LogError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(decode_record(&id.to_string(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `entry` and the advanced `document` row atomically.
    fn write_entry(&self, document: &Document, entry: &VersionEntry) -> Result<(), LogError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, entry_key(entry.document, entry.version), encode_record(entry)?);
        batch.put_cf(&cf_docs, document.id.as_bytes(), encode_record(document)?);
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), LogError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(StoreError::from)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl VersionLog for RocksLog {
    fn create_document(&self, mut document: Document, genesis: Operation) -> Result<VersionEntry, LogError> {
        let lock = self.lock_for(document.id);
        let _guard = lock.lock();

        if self.load_document(document.id)?.is_some() {
            return Err(LogError::DocumentExists(document.id));
        }
        document.version = 0;
        document.length = 0;
        let entry = advance(&mut document, genesis, 0)?;
        self.write_entry(&document, &entry)?;
        Ok(entry)
    }

    fn document(&self, id: DocumentId) -> Result<Document, LogError> {
        self.load_document(id)?.ok_or(LogError::DocumentNotFound(id))
    }

    fn list_documents(&self) -> Result<Vec<Document>, LogError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents: Vec<Document> = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(StoreError::from)?;
            let label = Uuid::from_slice(&key).map_or_else(|_| "document".to_string(), |id| id.to_string());
            documents.push(decode_record(&label, &value)?);
        }
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(documents)
    }

    fn append(&self, operation: Operation, expected_version: u64) -> Result<VersionEntry, LogError> {
        let id = operation.document;
        let lock = self.lock_for(id);
        let _guard = lock.lock();

        let mut document = self.document(id)?;
        let entry = advance(&mut document, operation, expected_version)?;
        self.write_entry(&document, &entry)?;
        Ok(entry)
    }

    fn entries_since(&self, id: DocumentId, version: u64) -> Result<Vec<VersionEntry>, LogError> {
        if self.load_document(id)?.is_none() {
            return Err(LogError::DocumentNotFound(id));
        }
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = entry_key(id, version.saturating_add(1));

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(StoreError::from)?;
            if key.len() != 24 || &key[..16] != id.as_bytes() {
                break;
            }
            let entry: VersionEntry = decode_record(&key_label(&key), &value)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn entry(&self, id: DocumentId, version: u64) -> Result<Option<VersionEntry>, LogError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let key = entry_key(id, version);
        match self.db.get_cf(&cf, &key).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(decode_record(&key_label(&key), &bytes)?)),
            None => Ok(None),
        }
    }

    fn load_snapshot(&self, id: DocumentId) -> Result<Option<Snapshot>, LogError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(decode_record(&id.to_string(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LogError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, snapshot.document.as_bytes(), encode_record(snapshot)?);
        self.write(batch)
    }
}

/// doc_id (16 bytes) ‖ version (8 bytes big-endian), so keys sort by version.
fn entry_key(id: DocumentId, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn key_label(key: &[u8]) -> String {
    match (key.get(..16).and_then(|b| Uuid::from_slice(b).ok()), key.get(16..24)) {
        (Some(id), Some(v)) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(v);
            format!("{id}@{}", u64::from_be_bytes(buf))
        }
        _ => "operation".to_string(),
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
