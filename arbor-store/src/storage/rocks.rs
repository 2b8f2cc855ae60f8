//! RocksDB-backed document store.
//!
//! Column families:
//! - `nodes`    — Tree nodes by id (LZ4-compressed JSON)
//! - `storage`  — Current cache entry per `(node, key)` (LZ4-compressed JSON)
//! - `versions` — Every cache write per `(node, key, clock)`, tombstones included
//! - `kinds`    — Node kind plus the clock at which it was dereferenced (bincode)
//! - `metadata` — Document metadata (bincode)
//!
//! Composite keys are length-prefixed so that all keys of one node are
//! contiguous, and clocks are big-endian so versions scan in order:
//!
//! ```text
//! storage:  <len(node):u32 BE><node><key>
//! versions: <len(node):u32 BE><node><len(key):u32 BE><key><clock:u64 BE>
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use crate::cache::{Entry, NodeRecord};
use crate::node::{Node, NodeId};

/// Column family names.
const CF_NODES: &str = "nodes";
const CF_STORAGE: &str = "storage";
const CF_VERSIONS: &str = "versions";
const CF_KINDS: &str = "kinds";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_NODES, CF_STORAGE, CF_VERSIONS, CF_KINDS, CF_METADATA];

/// Single metadata row per database.
const METADATA_KEY: &[u8] = b"document";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("arbor_data"),
            block_cache_size: 128 * 1024 * 1024, // 128MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Document metadata, rewritten with every cache commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Assigned when the database is first created
    pub doc_id: Uuid,
    /// Version Cache clock after the last commit
    pub clock: u64,
    /// Number of cache commits written
    pub commits: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last commit timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            doc_id: Uuid::new_v4(),
            clock: 0,
            commits: 0,
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

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// A commit would leave a key with more than one representation
    IntegrityError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IntegrityError(e) => write!(f, "Integrity violation: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// One cache transaction, ready to be written.
#[derive(Debug, Clone, Default)]
pub struct CacheCommit {
    /// Clock the transaction commits at
    pub clock: u64,
    /// Final state of every touched `(node, key)`; `None` is a tombstone
    pub writes: Vec<(NodeId, String, Option<Entry>)>,
    /// Kind records created or dereferenced in this transaction
    pub kinds: Vec<(NodeId, NodeRecord)>,
}

/// Everything the Version Cache persists, as loaded on open.
#[derive(Debug, Clone, Default)]
pub struct CacheImage {
    pub clock: u64,
    pub storage: Vec<(NodeId, String, Entry)>,
    pub versions: Vec<(NodeId, String, u64, Option<Entry>)>,
    pub kinds: Vec<(NodeId, NodeRecord)>,
}

/// RocksDB-backed store for one document.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode, one engine per document)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database, its column families and the metadata row if
    /// they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self { db, config };
        if store.read_metadata()?.is_none() {
            let meta = DocumentMetadata::new();
            let cf = store.cf(CF_METADATA)?;
            store.db.put_cf(&cf, METADATA_KEY, meta.encode()?)?;
            log::info!("Created document store {} at {:?}", meta.doc_id, store.path());
        } else {
            log::info!("Opened document store at {:?}", store.path());
        }
        Ok(store)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NODES | CF_STORAGE => {
                // Point lookups by id / (id, key), full scan on open
                opts.set_max_write_buffer_number(3);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-only, many small writes, read back in key order
                opts.set_max_write_buffer_number(4);
            }
            CF_KINDS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Tree nodes ───────────────────────────────────────────────────

    /// Load every persisted tree node.
    pub fn load_nodes(&self) -> Result<Vec<(NodeId, Node)>, StoreError> {
        let cf = self.cf(CF_NODES)?;
        let mut nodes = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            nodes.push((id, decode_json(&value)?));
        }
        Ok(nodes)
    }

    /// Write node puts and deletes in one atomic batch.
    pub fn write_nodes(&self, puts: &[(NodeId, Node)], deletes: &[NodeId]) -> Result<usize, StoreError> {
        if puts.is_empty() && deletes.is_empty() {
            return Ok(0);
        }
        let cf = self.cf(CF_NODES)?;
        let mut batch = WriteBatch::default();
        for id in deletes {
            batch.delete_cf(&cf, id.as_bytes());
        }
        for (id, node) in puts {
            batch.put_cf(&cf, id.as_bytes(), encode_json(node)?);
        }
        self.write(batch)?;
        Ok(puts.len() + deletes.len())
    }

    // ─── Version Cache tables ─────────────────────────────────────────

    /// Load the cache tables and clock.
    pub fn load_cache(&self) -> Result<CacheImage, StoreError> {
        let mut image = CacheImage {
            clock: self.load_metadata()?.clock,
            ..CacheImage::default()
        };

        let cf = self.cf(CF_STORAGE)?;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let (node, key) = split_storage_key(&key)?;
            image.storage.push((node, key, decode_json(&value)?));
        }

        let cf = self.cf(CF_VERSIONS)?;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let (node, key, clock) = split_version_key(&key)?;
            image.versions.push((node, key, clock, decode_json(&value)?));
        }

        let cf = self.cf(CF_KINDS)?;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let (record, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            image.kinds.push((id, record));
        }

        Ok(image)
    }

    /// Write one cache transaction atomically, along with updated metadata.
    pub fn commit_cache(&self, commit: &CacheCommit) -> Result<DocumentMetadata, StoreError> {
        let mut seen = std::collections::HashSet::new();
        for (node, key, _) in &commit.writes {
            if !seen.insert((node, key)) {
                return Err(StoreError::IntegrityError(format!(
                    "{node}[{key:?}] written twice in commit {}",
                    commit.clock
                )));
            }
        }

        let cf_storage = self.cf(CF_STORAGE)?;
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_kinds = self.cf(CF_KINDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata()?;
        meta.clock = commit.clock;
        meta.commits += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        for (node, key, entry) in &commit.writes {
            let storage_key = storage_key(node, key);
            match entry {
                Some(entry) => batch.put_cf(&cf_storage, &storage_key, encode_json(entry)?),
                None => batch.delete_cf(&cf_storage, &storage_key),
            }
            batch.put_cf(
                &cf_versions,
                version_key(node, key, commit.clock),
                encode_json(entry)?,
            );
        }
        for (id, record) in &commit.kinds {
            let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            batch.put_cf(&cf_kinds, id.as_bytes(), bytes);
        }
        batch.put_cf(&cf_meta, METADATA_KEY, meta.encode()?);

        self.write(batch)?;
        log::trace!(
            "Committed cache clock {} ({} writes, {} kinds)",
            commit.clock,
            commit.writes.len(),
            commit.kinds.len()
        );
        Ok(meta)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document metadata.
    pub fn load_metadata(&self) -> Result<DocumentMetadata, StoreError> {
        self.read_metadata()?
            .ok_or_else(|| StoreError::DatabaseError("metadata row missing".into()))
    }

    fn read_metadata(&self) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, METADATA_KEY)? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").field("path", &self.config.path).finish()
    }
}

// ─── Record codec ───────────────────────────────────────────────────────

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

/// `<len(node):u32 BE><node><key>`
fn storage_key(node: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + node.len() + key.len());
    out.extend_from_slice(&(node.len() as u32).to_be_bytes());
    out.extend_from_slice(node.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// `<len(node):u32 BE><node><len(key):u32 BE><key><clock:u64 BE>`
fn version_key(node: &str, key: &str, clock: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + node.len() + key.len());
    out.extend_from_slice(&(node.len() as u32).to_be_bytes());
    out.extend_from_slice(node.as_bytes());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&clock.to_be_bytes());
    out
}

/// Read a length-prefixed string, returning it and the remaining bytes.
fn take_prefixed(bytes: &[u8]) -> Result<(String, &[u8]), StoreError> {
    let malformed = || StoreError::DeserializationError("Malformed composite key".into());
    let len_bytes: [u8; 4] = bytes.get(..4).ok_or_else(malformed)?.try_into().map_err(|_| malformed())?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let body = bytes.get(4..4 + len).ok_or_else(malformed)?;
    let text = String::from_utf8(body.to_vec())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok((text, &bytes[4 + len..]))
}

fn split_storage_key(bytes: &[u8]) -> Result<(NodeId, String), StoreError> {
    let (node, rest) = take_prefixed(bytes)?;
    let key = String::from_utf8(rest.to_vec())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok((node, key))
}

fn split_version_key(bytes: &[u8]) -> Result<(NodeId, String, u64), StoreError> {
    let (node, rest) = take_prefixed(bytes)?;
    let (key, rest) = take_prefixed(rest)?;
    let clock: [u8; 8] = rest
        .try_into()
        .map_err(|_| StoreError::DeserializationError("Malformed version clock".into()))?;
    Ok((node, key, u64::from_be_bytes(clock)))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CrdtKind, ParentRef, ROOT_ID};
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open_creates_metadata() {
        let (_dir, store) = open_temp();
        let meta = store.load_metadata().unwrap();
        assert_eq!(meta.clock, 0);
        assert_eq!(meta.commits, 0);
        assert!(store.path().exists());
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.load_metadata().unwrap().doc_id
        };
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_metadata().unwrap().doc_id, doc_id);
    }

    #[test]
    fn test_nodes_write_load_delete() {
        let (_dir, store) = open_temp();
        let list = Node::list(ParentRef::new(ROOT_ID, "items"));
        let reg = Node::register(ParentRef::new("L", "!"), json!({"n": 1}));
        let written = store
            .write_nodes(&[("L".into(), list.clone()), ("r".into(), reg)], &[])
            .unwrap();
        assert_eq!(written, 2);

        store.write_nodes(&[], &["r".to_string()]).unwrap();
        let nodes = store.load_nodes().unwrap();
        assert_eq!(nodes, vec![("L".to_string(), list)]);
        assert_eq!(store.write_nodes(&[], &[]).unwrap(), 0);
    }

    #[test]
    fn test_cache_commit_and_load() {
        let (_dir, store) = open_temp();
        let commit = CacheCommit {
            clock: 1,
            writes: vec![
                (ROOT_ID.into(), "title".into(), Some(Entry::Value(json!("hi")))),
                (ROOT_ID.into(), "items".into(), Some(Entry::Ref("1:0".into()))),
            ],
            kinds: vec![("1:0".into(), NodeRecord::new(CrdtKind::List, 1))],
        };
        let meta = store.commit_cache(&commit).unwrap();
        assert_eq!(meta.clock, 1);
        assert_eq!(meta.commits, 1);

        let tombstone = CacheCommit {
            clock: 2,
            writes: vec![(ROOT_ID.into(), "title".into(), None)],
            kinds: Vec::new(),
        };
        store.commit_cache(&tombstone).unwrap();

        let image = store.load_cache().unwrap();
        assert_eq!(image.clock, 2);
        assert_eq!(
            image.storage,
            vec![(ROOT_ID.to_string(), "items".to_string(), Entry::Ref("1:0".into()))]
        );
        assert_eq!(image.versions.len(), 3);
        // Versions of one key come out in clock order.
        let title_versions: Vec<u64> = image
            .versions
            .iter()
            .filter(|(_, key, _, _)| key == "title")
            .map(|(_, _, clock, _)| *clock)
            .collect();
        assert_eq!(title_versions, vec![1, 2]);
        assert_eq!(image.kinds.len(), 1);
    }

    #[test]
    fn test_commit_rejects_duplicate_key() {
        let (_dir, store) = open_temp();
        let commit = CacheCommit {
            clock: 1,
            writes: vec![
                (ROOT_ID.into(), "a".into(), Some(Entry::Value(json!(1)))),
                (ROOT_ID.into(), "a".into(), None),
            ],
            kinds: Vec::new(),
        };
        assert!(matches!(
            store.commit_cache(&commit),
            Err(StoreError::IntegrityError(_))
        ));
        // Nothing written.
        assert_eq!(store.load_metadata().unwrap().clock, 0);
        assert!(store.load_cache().unwrap().versions.is_empty());
    }

    #[test]
    fn test_composite_keys_split() {
        let key = version_key("n:1", "k\u{0}ey", 42);
        assert_eq!(
            split_version_key(&key).unwrap(),
            ("n:1".to_string(), "k\u{0}ey".to_string(), 42)
        );
        assert_eq!(
            split_storage_key(&storage_key("n", "")).unwrap(),
            ("n".to_string(), String::new())
        );
        assert!(split_version_key(&[0, 0]).is_err());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 128 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::IntegrityError("dup".into());
        assert!(err.to_string().contains("Integrity"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
