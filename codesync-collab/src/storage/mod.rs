//! Persistent storage layer for project files and sessions.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  update_if_version  ┌──────────────────┐
//! │ FileSyncService │ ──────────────────► │ LazyStore        │
//! └─────────────────┘                     │ (opened on first │
//! ┌─────────────────┐  put_session        │  use, then kept) │
//! │ PresenceManager │ ──────────────────► └────────┬─────────┘
//! └─────────────────┘                              │ dyn Store
//!                               ┌──────────────────┴────────┐
//!                               ▼                           ▼
//!                        ┌─────────────┐             ┌─────────────┐
//!                        │ RocksStore  │             │ MemoryStore │
//!                        │ (durable)   │             │ (tests/dev) │
//!                        └─────────────┘             └─────────────┘
//! ```
//!
//! The one hard consistency rule of the system lives here:
//! [`VersionStore::update_if_version`] is a single atomic compare-and-set.
//! Two writers supplying the same expected version get exactly one
//! `Committed` and one `Conflict`.

pub mod memory;
pub mod rocks;

use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::model::{File, Revision, Session};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Revisions kept per file unless configured otherwise.
pub const DEFAULT_REVISION_LIMIT: usize = 50;

/// Result of a compare-and-set update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Stored version matched; the new record (version + 1) is durable.
    Committed(File),
    /// Stored version differed; nothing was written.
    Conflict { current: File },
    /// No record with this id.
    Missing,
    /// The id names a folder, which has no content to update.
    NotAFile,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Record not found
    NotFound(Uuid),
    /// Parent is missing, not a folder, or belongs to another project
    ParentNotFound(Uuid),
    /// A record with this id already exists
    AlreadyExists(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Record not found: {id}"),
            StoreError::ParentNotFound(id) => write!(f, "Parent folder not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Record already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable {content, version} record per file.
pub trait VersionStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<File>, StoreError>;

    /// Insert a new record and its first revision.
    ///
    /// The parent check and the insert are one step: a concurrent
    /// `remove_tree` of the parent either runs before (→ `ParentNotFound`)
    /// or after (and then removes the new child too).
    fn create(&self, file: &File) -> Result<(), StoreError>;

    /// Atomic "set content if stored version == expected".
    fn update_if_version(
        &self,
        id: Uuid,
        content: &str,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;

    /// Delete a record and, for folders, every descendant.
    /// Returns removed ids, children before their parents.
    fn remove_tree(&self, id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Records matching the optional filters, content included.
    fn list(&self, project_id: Option<Uuid>, parent_id: Option<Uuid>) -> Result<Vec<File>, StoreError>;

    /// Retained revisions of a file, oldest first.
    fn revisions(&self, id: Uuid) -> Result<Vec<Revision>, StoreError>;

    /// Drop all but the newest `keep_last` revisions. Returns how many went.
    fn compact_revisions(&self, id: Uuid, keep_last: usize) -> Result<u64, StoreError>;

    /// Push buffered writes to disk. A no-op for volatile stores.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Persisted session documents (survive disconnects for resume).
pub trait SessionStore: Send + Sync {
    fn put_session(&self, session: &Session) -> Result<(), StoreError>;
    fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError>;
    fn remove_session(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Ids of sessions whose [`Session::last_active`] is at or before `cutoff`.
    fn stale_sessions(&self, cutoff: u64) -> Result<Vec<Uuid>, StoreError>;
}

/// Everything the server needs from persistence.
pub trait Store: VersionStore + SessionStore {}

impl<T: VersionStore + SessionStore> Store for T {}

/// How a [`LazyStore`] opens its backend.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory { revision_limit: usize },
    Rocks(StoreConfig),
}

/// Explicitly owned, lazily opened store handle.
///
/// The backend is opened on the first call to [`LazyStore::get`] and the
/// same handle is reused afterwards. A failed open is not cached, so the
/// next call retries.
pub struct LazyStore {
    backend: StoreBackend,
    cell: OnceCell<Arc<dyn Store>>,
}

impl LazyStore {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            cell: OnceCell::new(),
        }
    }

    /// RocksDB-backed handle (opened on first use).
    pub fn rocks(config: StoreConfig) -> Self {
        Self::new(StoreBackend::Rocks(config))
    }

    /// In-memory handle keeping [`DEFAULT_REVISION_LIMIT`] revisions per file.
    pub fn memory() -> Self {
        Self::new(StoreBackend::Memory {
            revision_limit: DEFAULT_REVISION_LIMIT,
        })
    }

    /// Wrap an already opened store.
    pub fn from_store(store: Arc<dyn Store>) -> Self {
        Self {
            backend: StoreBackend::Memory {
                revision_limit: DEFAULT_REVISION_LIMIT,
            },
            cell: OnceCell::new_with(Some(store)),
        }
    }

    /// Get the store, opening it if this is the first use.
    pub async fn get(&self) -> Result<Arc<dyn Store>, StoreError> {
        let store = self
            .cell
            .get_or_try_init(|| async {
                let store: Arc<dyn Store> = match &self.backend {
                    StoreBackend::Memory { revision_limit } => {
                        Arc::new(MemoryStore::with_revision_limit(*revision_limit))
                    }
                    StoreBackend::Rocks(config) => {
                        log::info!("Opening RocksDB store at {}", config.path.display());
                        Arc::new(RocksStore::open(config.clone())?)
                    }
                };
                Ok::<_, StoreError>(store)
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// Flush the backend if it was ever opened.
    pub fn sync(&self) -> Result<(), StoreError> {
        match self.cell.get() {
            Some(store) => store.sync(),
            None => Ok(()),
        }
    }

    /// Whether the backend has been opened yet.
    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_millis, FileKind};

    fn sample_file() -> File {
        let now = now_millis();
        File {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            parent_id: None,
            name: "main.move".into(),
            kind: FileKind::File,
            content: Some("module 0x1::M {}".into()),
            language: None,
            version: 1,
            created_at: now,
            last_synced: now,
        }
    }

    #[tokio::test]
    async fn test_lazy_store_opens_on_first_use() {
        let lazy = LazyStore::memory();
        assert!(!lazy.is_open());

        let store = lazy.get().await.unwrap();
        assert!(lazy.is_open());

        let file = sample_file();
        store.create(&file).unwrap();

        // Same handle on every call
        let again = lazy.get().await.unwrap();
        assert_eq!(again.get(file.id).unwrap(), Some(file));
    }

    #[tokio::test]
    async fn test_lazy_store_from_existing() {
        let inner: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let file = sample_file();
        inner.create(&file).unwrap();

        let lazy = LazyStore::from_store(inner);
        assert!(lazy.is_open());
        assert!(lazy.get().await.unwrap().get(file.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lazy_rocks_store() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyStore::rocks(StoreConfig::for_testing(dir.path().join("db")));
        assert!(!lazy.is_open());

        let store = lazy.get().await.unwrap();
        let file = sample_file();
        store.create(&file).unwrap();
        assert_eq!(store.get(file.id).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_default_memory_store_bounds_history() {
        let lazy = LazyStore::memory();
        let store = lazy.get().await.unwrap();
        let file = sample_file();
        store.create(&file).unwrap();

        for version in 1..=200u64 {
            let outcome = store
                .update_if_version(file.id, &format!("v{version}"), version)
                .unwrap();
            assert!(matches!(outcome, CasOutcome::Committed(_)));
        }

        let history = store.revisions(file.id).unwrap();
        assert_eq!(history.len(), DEFAULT_REVISION_LIMIT);
        assert_eq!(history.last().unwrap().version, 201);
    }

    #[tokio::test]
    async fn test_sync_unopened_store_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyStore::rocks(StoreConfig::for_testing(dir.path().join("db")));
        lazy.sync().unwrap();
        assert!(!lazy.is_open());
    }

    #[tokio::test]
    async fn test_sync_flushes_opened_rocks_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let file = sample_file();
        {
            let lazy = LazyStore::rocks(StoreConfig::for_testing(path.clone()));
            lazy.get().await.unwrap().create(&file).unwrap();
            lazy.sync().unwrap();
        }

        let reopened = LazyStore::rocks(StoreConfig::for_testing(path));
        let store = reopened.get().await.unwrap();
        assert_eq!(store.get(file.id).unwrap(), Some(file));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));

        let err = StoreError::ParentNotFound(Uuid::nil());
        assert!(err.to_string().contains("Parent folder"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
