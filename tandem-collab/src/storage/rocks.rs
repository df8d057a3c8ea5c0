//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed document text + revision
//! - `metadata`  — per-document bookkeeping (revision, sizes, timestamps)
//!
//! Snapshots are written on session drain/close and read on hydration, so
//! the store sits entirely off the submit hot path.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use super::{Snapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Revision of the latest persisted snapshot
    pub revision: u64,
    /// Uncompressed text size in bytes
    pub text_bytes: u64,
    /// Compressed size in bytes
    pub compressed_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last persisted timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            revision: 0,
            text_bytes: 0,
            compressed_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// On-disk snapshot record: revision plus LZ4-compressed text.
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    revision: u64,
    compressed: Vec<u8>,
}

/// RocksDB-backed snapshot store.
pub struct RocksSnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Block-based table with bloom filter and cache. Snapshot values are
    /// already LZ4-compressed, so the table itself stays uncompressed.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family: {name}")))
    }

    /// Load a document's metadata, if any.
    pub fn metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let bytes = match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let (stored, _): (StoredSnapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let raw = lz4_flex::decompress_size_prepended(&stored.compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let text = String::from_utf8(raw)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

        Ok(Some(Snapshot {
            doc_id,
            text,
            revision: stored.revision,
        }))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot.text.as_bytes());
        let stored = StoredSnapshot {
            revision: snapshot.revision,
            compressed,
        };
        let value = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = self
            .metadata(snapshot.doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(snapshot.doc_id));
        meta.revision = snapshot.revision;
        meta.text_bytes = snapshot.text.len() as u64;
        meta.compressed_bytes = stored.compressed.len() as u64;
        meta.updated_at = unix_now();

        // Atomic batch write: snapshot + metadata
        let key = snapshot.doc_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, &key, &value);
        batch.put_cf(cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    fn remove(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = doc_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snapshots, &key);
        batch.delete_cf(cf_meta, &key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if let Ok(doc_id) = Uuid::from_slice(&key) {
                docs.push(doc_id);
            }
        }
        Ok(docs)
    }
}
