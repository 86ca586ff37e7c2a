//! Server-side file operations with optimistic concurrency.
//!
//! Every call goes to the store; nothing is cached here. The only rule
//! that matters for correctness is delegated to
//! [`VersionStore::update_if_version`](crate::storage::VersionStore::update_if_version):
//! an update carries the version it was based on and is rejected with
//! [`SyncError::VersionConflict`] when someone else committed first.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::SaveTransport;
use crate::model::{now_millis, ConflictResult, File, FileKind, NewFile, Revision};
use crate::protocol::{
    STATUS_BAD_REQUEST, STATUS_CONFLICT, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND,
    STATUS_UNAVAILABLE,
};
use crate::storage::{CasOutcome, LazyStore, Store, StoreError};

/// Errors of file operations, as seen by both server and client.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed request (bad name, content on a folder, update of a folder)
    Validation(String),
    /// No such file, or no such parent folder
    NotFound(Uuid),
    /// The base version was stale. Carries the authoritative copy.
    VersionConflict {
        conflict: ConflictResult,
        server_file: Box<File>,
    },
    /// Connection lost, timeout or store unavailable. Worth retrying.
    Transient(String),
    /// Store failure
    Storage(StoreError),
}

impl SyncError {
    /// Status code used on the wire.
    pub fn status(&self) -> u16 {
        match self {
            SyncError::Validation(_) => STATUS_BAD_REQUEST,
            SyncError::NotFound(_) => STATUS_NOT_FOUND,
            SyncError::VersionConflict { .. } => STATUS_CONFLICT,
            SyncError::Transient(_) => STATUS_UNAVAILABLE,
            SyncError::Storage(_) => STATUS_INTERNAL_ERROR,
        }
    }

    /// Whether an automatic retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn conflict(&self) -> Option<&ConflictResult> {
        match self {
            SyncError::VersionConflict { conflict, .. } => Some(conflict),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Validation(msg) => write!(f, "Validation error: {msg}"),
            SyncError::NotFound(id) => write!(f, "File not found: {id}"),
            SyncError::VersionConflict { conflict, .. } => write!(
                f,
                "Version conflict on {}: sent version {}, server has {}",
                conflict.file_id, conflict.attempted_version, conflict.server_version
            ),
            SyncError::Transient(msg) => write!(f, "Temporarily unavailable: {msg}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) | StoreError::ParentNotFound(id) => SyncError::NotFound(id),
            other => SyncError::Storage(other),
        }
    }
}

/// Create/read/update/delete/list over project files.
#[derive(Clone)]
pub struct FileSyncService {
    store: Arc<LazyStore>,
}

impl FileSyncService {
    pub fn new(store: Arc<LazyStore>) -> Self {
        Self { store }
    }

    /// The shared store handle.
    pub fn store(&self) -> &Arc<LazyStore> {
        &self.store
    }

    async fn open(&self) -> Result<Arc<dyn Store>, SyncError> {
        self.store.get().await.map_err(|e| {
            log::error!("Store unavailable: {e}");
            SyncError::Transient(e.to_string())
        })
    }

    /// Create a file or folder at version 1.
    pub async fn create_file(&self, new: NewFile) -> Result<File, SyncError> {
        validate_name(&new.name)?;
        if new.kind == FileKind::Folder && new.content.is_some() {
            return Err(SyncError::Validation("A folder cannot have content".into()));
        }

        let now = now_millis();
        let file = File {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            parent_id: new.parent_id,
            name: new.name,
            content: match new.kind {
                FileKind::File => Some(new.content.unwrap_or_default()),
                FileKind::Folder => None,
            },
            kind: new.kind,
            language: new.language,
            version: 1,
            created_at: now,
            last_synced: now,
        };

        self.open().await?.create(&file)?;
        log::info!(
            "Created {:?} '{}' ({}) in project {}",
            file.kind,
            file.name,
            file.id,
            file.project_id
        );
        Ok(file)
    }

    pub async fn get_file(&self, id: Uuid) -> Result<File, SyncError> {
        self.open().await?.get(id)?.ok_or(SyncError::NotFound(id))
    }

    /// Replace the content if `version` is still the stored version.
    pub async fn update_file(&self, id: Uuid, content: &str, version: u64) -> Result<File, SyncError> {
        match self.open().await?.update_if_version(id, content, version)? {
            CasOutcome::Committed(file) => {
                log::debug!("Saved {id} at version {}", file.version);
                Ok(file)
            }
            CasOutcome::Conflict { current } => {
                log::info!(
                    "Version conflict on {id}: client sent {version}, server has {}",
                    current.version
                );
                Err(SyncError::VersionConflict {
                    conflict: ConflictResult {
                        file_id: id,
                        attempted_version: version,
                        attempted_content: content.to_string(),
                        server_version: current.version,
                        server_content: current.text().to_string(),
                    },
                    server_file: Box::new(current),
                })
            }
            CasOutcome::Missing => Err(SyncError::NotFound(id)),
            CasOutcome::NotAFile => Err(SyncError::Validation(format!("{id} is a folder"))),
        }
    }

    /// Delete a file, or a folder with everything under it.
    /// Returns the removed ids, children before parents.
    pub async fn delete_file(&self, id: Uuid) -> Result<Vec<Uuid>, SyncError> {
        let removed = self.open().await?.remove_tree(id)?;
        log::info!("Deleted {id} ({} entries)", removed.len());
        Ok(removed)
    }

    /// Content-free listing: folders first, then by name, then by id.
    pub async fn list_files(
        &self,
        project_id: Option<Uuid>,
        parent_id: Option<Uuid>,
    ) -> Result<Vec<File>, SyncError> {
        let mut files: Vec<File> = self
            .open()
            .await?
            .list(project_id, parent_id)?
            .iter()
            .map(File::without_content)
            .collect();
        files.sort_by(|a, b| {
            b.is_folder()
                .cmp(&a.is_folder())
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(files)
    }

    /// Retained revisions, oldest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<Revision>, SyncError> {
        let store = self.open().await?;
        if store.get(id)?.is_none() {
            return Err(SyncError::NotFound(id));
        }
        Ok(store.revisions(id)?)
    }

    /// Keep only the newest `keep_last` revisions. Returns how many went.
    pub async fn compact_history(&self, id: Uuid, keep_last: usize) -> Result<u64, SyncError> {
        let store = self.open().await?;
        if store.get(id)?.is_none() {
            return Err(SyncError::NotFound(id));
        }
        let removed = store.compact_revisions(id, keep_last)?;
        if removed > 0 {
            log::debug!("Compacted {removed} revisions of {id}");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SaveTransport for FileSyncService {
    async fn save(&self, file_id: Uuid, content: String, base_version: u64) -> Result<File, SyncError> {
        self.update_file(file_id, &content, base_version).await
    }
}

fn validate_name(name: &str) -> Result<(), SyncError> {
    if name.trim().is_empty() {
        return Err(SyncError::Validation("Name must not be empty".into()));
    }
    if name.contains('/') {
        return Err(SyncError::Validation(format!("Name must not contain '/': {name}")));
    }
    Ok(())
}
