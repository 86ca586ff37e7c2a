//! RocksDB-backed persistent file store.
//!
//! Column families:
//! - `files`: File records (bincode, LZ4 compressed), keyed by id
//! - `tree`: Empty values keyed `project:16 | parent:16 | id:16`
//!   (nil parent = root) for ordered child scans
//! - `revisions`: Committed contents keyed `id:16 | version:8 BE`
//! - `sessions`: Session documents (bincode), keyed by id
//!
//! Every mutation takes `write_lock`, reads the current record and commits
//! one `WriteBatch`. Holding the lock across read-compare-write is what
//! makes `update_if_version` a true compare-and-set: no other writer can
//! slip a version in between. Readers never take the lock; RocksDB makes
//! each batch visible atomically.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{CasOutcome, SessionStore, StoreError, VersionStore};
use crate::model::{now_millis, File, FileKind, Revision, Session};

/// Column family names.
const CF_FILES: &str = "files";
const CF_TREE: &str = "tree";
const CF_REVISIONS: &str = "revisions";
const CF_SESSIONS: &str = "sessions";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_FILES, CF_TREE, CF_REVISIONS, CF_SESSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true). A save is acknowledged
    /// to the editor only once durable.
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Revisions retained per file, 0 = unlimited (default: 50)
    pub revision_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            revision_limit: super::DEFAULT_REVISION_LIMIT,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            revision_limit: 0,
        }
    }
}

/// RocksDB-backed implementation of [`VersionStore`] and [`SessionStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, writes serialized by `write_lock`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-compare-write sequences
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
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

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_FILES | CF_SESSIONS => {
                // Point lookups by id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            CF_TREE => {
                // Prefix-scanned by project id; values are empty
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_REVISIONS => {
                // Append-mostly, prefix-scanned by file id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

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

    /// Tree key: project (16) + parent or nil (16) + id (16).
    fn tree_key(file: &File) -> Vec<u8> {
        let mut key = Vec::with_capacity(48);
        key.extend_from_slice(file.project_id.as_bytes());
        key.extend_from_slice(file.parent_id.unwrap_or(Uuid::nil()).as_bytes());
        key.extend_from_slice(file.id.as_bytes());
        key
    }

    /// Revision key: file id (16 bytes) + version (8 bytes big-endian).
    fn revision_key(id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn put_revision(&self, batch: &mut WriteBatch, file: &File) -> Result<(), StoreError> {
        let cf_revisions = self.cf(CF_REVISIONS)?;
        let revision = Revision {
            version: file.version,
            content: file.text().to_string(),
            saved_at: file.last_synced,
        };
        batch.put_cf(
            &cf_revisions,
            Self::revision_key(file.id, file.version),
            encode_compressed(&revision)?,
        );

        // Versions are contiguous, so at most one falls out of the window.
        let limit = self.config.revision_limit as u64;
        if limit > 0 && file.version > limit {
            batch.delete_cf(&cf_revisions, Self::revision_key(file.id, file.version - limit));
        }
        Ok(())
    }

    /// Ids of the direct children of `parent` within `project_id`.
    fn children(&self, project_id: Uuid, parent: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_TREE)?;
        let mut prefix = Vec::with_capacity(32);
        prefix.extend_from_slice(project_id.as_bytes());
        prefix.extend_from_slice(parent.as_bytes());

        let mut ids = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() != 48 || key[..32] != prefix[..] {
                break;
            }
            ids.push(uuid_from(&key[32..48])?);
        }
        Ok(ids)
    }

    /// Ids of every node of a project, in tree-key order.
    fn project_ids(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_TREE)?;
        let prefix = project_id.as_bytes().to_vec();

        let mut ids = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() != 48 || key[..16] != prefix[..] {
                break;
            }
            ids.push(uuid_from(&key[32..48])?);
        }
        Ok(ids)
    }

    fn load_many(&self, ids: Vec<Uuid>) -> Result<Vec<File>, StoreError> {
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(file) = self.get(id)? {
                files.push(file);
            }
        }
        Ok(files)
    }
}

impl VersionStore for RocksStore {
    fn get(&self, id: Uuid) -> Result<Option<File>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_compressed(&bytes)?)),
            None => Ok(None),
        }
    }

    fn create(&self, file: &File) -> Result<(), StoreError> {
        let _guard = self.lock();

        if self.get(file.id)?.is_some() {
            return Err(StoreError::AlreadyExists(file.id));
        }
        if let Some(parent_id) = file.parent_id {
            match self.get(parent_id)? {
                Some(parent) if parent.kind == FileKind::Folder && parent.project_id == file.project_id => {}
                _ => return Err(StoreError::ParentNotFound(parent_id)),
            }
        }

        let cf_files = self.cf(CF_FILES)?;
        let cf_tree = self.cf(CF_TREE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_files, file.id.as_bytes(), encode_compressed(file)?);
        batch.put_cf(&cf_tree, Self::tree_key(file), b"");
        if file.kind == FileKind::File {
            self.put_revision(&mut batch, file)?;
        }
        self.write(batch)
    }

    fn update_if_version(
        &self,
        id: Uuid,
        content: &str,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let _guard = self.lock();

        let mut file = match self.get(id)? {
            None => return Ok(CasOutcome::Missing),
            Some(f) if f.kind == FileKind::Folder => return Ok(CasOutcome::NotAFile),
            Some(f) if f.version != expected_version => {
                return Ok(CasOutcome::Conflict { current: f });
            }
            Some(f) => f,
        };

        file.version += 1;
        file.content = Some(content.to_string());
        file.last_synced = now_millis();

        let cf_files = self.cf(CF_FILES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_files, id.as_bytes(), encode_compressed(&file)?);
        self.put_revision(&mut batch, &file)?;
        self.write(batch)?;

        Ok(CasOutcome::Committed(file))
    }

    fn remove_tree(&self, id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let _guard = self.lock();

        let root = self.get(id)?.ok_or(StoreError::NotFound(id))?;

        // Post-order walk: children are queued before their parent.
        let mut doomed: Vec<File> = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((file, expanded)) = stack.pop() {
            if expanded || file.kind == FileKind::File {
                doomed.push(file);
                continue;
            }
            let children = self.children(file.project_id, file.id)?;
            stack.push((file, true));
            for child in self.load_many(children)? {
                stack.push((child, false));
            }
        }

        let cf_files = self.cf(CF_FILES)?;
        let cf_tree = self.cf(CF_TREE)?;
        let cf_revisions = self.cf(CF_REVISIONS)?;

        let mut batch = WriteBatch::default();
        for file in &doomed {
            batch.delete_cf(&cf_files, file.id.as_bytes());
            batch.delete_cf(&cf_tree, Self::tree_key(file));
            batch.delete_range_cf(
                &cf_revisions,
                Self::revision_key(file.id, 0),
                Self::revision_key(file.id, u64::MAX),
            );
        }
        self.write(batch)?;

        Ok(doomed.into_iter().map(|f| f.id).collect())
    }

    fn list(&self, project_id: Option<Uuid>, parent_id: Option<Uuid>) -> Result<Vec<File>, StoreError> {
        match (project_id, parent_id) {
            (Some(project), Some(parent)) => {
                let ids = self.children(project, parent)?;
                self.load_many(ids)
            }
            (Some(project), None) => {
                let ids = self.project_ids(project)?;
                self.load_many(ids)
            }
            (None, parent) => {
                let cf = self.cf(CF_FILES)?;
                let mut files = Vec::new();
                for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                    let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
                    let file: File = decode_compressed(&value)?;
                    if parent.is_none() || file.parent_id == parent {
                        files.push(file);
                    }
                }
                Ok(files)
            }
        }
    }

    fn revisions(&self, id: Uuid) -> Result<Vec<Revision>, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        let start_key = Self::revision_key(id, 0);

        let mut revisions = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            revisions.push(decode_compressed(&value)?);
        }
        Ok(revisions)
    }

    fn compact_revisions(&self, id: Uuid, keep_last: usize) -> Result<u64, StoreError> {
        let _guard = self.lock();

        let cf = self.cf(CF_REVISIONS)?;
        let start_key = Self::revision_key(id, 0);

        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            keys.push(key);
        }

        let excess = keys.len().saturating_sub(keep_last);
        if excess == 0 {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for key in &keys[..excess] {
            batch.delete_cf(&cf, key);
        }
        self.write(batch)?;
        Ok(excess as u64)
    }

    /// Flush every memtable to disk.
    fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(&self.cf(name)?)?;
        }
        Ok(())
    }
}

impl SessionStore for RocksStore {
    fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let bytes = bincode::serde::encode_to_vec(session, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, session.id.as_bytes(), bytes, &write_opts)?;
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => {
                let (session, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn remove_session(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let existed = self.db.get_cf(&cf, id.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(&cf, id.as_bytes())?;
        }
        Ok(existed)
    }

    fn stale_sessions(&self, cutoff: u64) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut stale = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let (session, _): (Session, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if session.last_active() <= cutoff {
                stale.push(session.id);
            }
        }
        Ok(stale)
    }
}

/// bincode + LZ4 (size-prepended).
fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn uuid_from(bytes: &[u8]) -> Result<Uuid, StoreError> {
    Uuid::from_slice(bytes).map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
