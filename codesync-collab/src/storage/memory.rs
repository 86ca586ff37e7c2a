//! In-memory store for tests and ephemeral servers.
//!
//! All state sits behind one mutex, so every operation (including the
//! compare-and-set) is trivially atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{CasOutcome, SessionStore, StoreError, VersionStore};
use crate::model::{now_millis, File, FileKind, Revision, Session};

#[derive(Default)]
struct MemoryInner {
    files: HashMap<Uuid, File>,
    revisions: HashMap<Uuid, VecDeque<Revision>>,
    sessions: HashMap<Uuid, Session>,
}

impl MemoryInner {
    fn descendants_first(&self, root: Uuid) -> Vec<Uuid> {
        // Post-order walk: every child is listed before its parent.
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            let mut children: Vec<Uuid> = self
                .files
                .values()
                .filter(|f| f.parent_id == Some(id))
                .map(|f| f.id)
                .collect();
            children.sort();
            for child in children {
                stack.push((child, false));
            }
        }
        order
    }
}

/// Mutex-guarded maps implementing [`VersionStore`] and [`SessionStore`].
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    /// Revisions kept per file (0 = unlimited)
    revision_limit: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_revision_limit(0)
    }

    pub fn with_revision_limit(revision_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            revision_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // Poison is ignored: each mutation below is a single map write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_revision(&self, inner: &mut MemoryInner, id: Uuid, revision: Revision) {
        let history = inner.revisions.entry(id).or_default();
        history.push_back(revision);
        if self.revision_limit > 0 {
            while history.len() > self.revision_limit {
                history.pop_front();
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore for MemoryStore {
    fn get(&self, id: Uuid) -> Result<Option<File>, StoreError> {
        Ok(self.lock().files.get(&id).cloned())
    }

    fn create(&self, file: &File) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.files.contains_key(&file.id) {
            return Err(StoreError::AlreadyExists(file.id));
        }
        if let Some(parent_id) = file.parent_id {
            match inner.files.get(&parent_id) {
                Some(parent) if parent.kind == FileKind::Folder && parent.project_id == file.project_id => {}
                _ => return Err(StoreError::ParentNotFound(parent_id)),
            }
        }
        inner.files.insert(file.id, file.clone());
        if let Some(content) = &file.content {
            let revision = Revision {
                version: file.version,
                content: content.clone(),
                saved_at: file.last_synced,
            };
            self.push_revision(&mut inner, file.id, revision);
        }
        Ok(())
    }

    fn update_if_version(
        &self,
        id: Uuid,
        content: &str,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.lock();
        let updated = match inner.files.get_mut(&id) {
            None => return Ok(CasOutcome::Missing),
            Some(file) if file.kind == FileKind::Folder => return Ok(CasOutcome::NotAFile),
            Some(file) if file.version != expected_version => {
                return Ok(CasOutcome::Conflict { current: file.clone() });
            }
            Some(file) => {
                file.version += 1;
                file.content = Some(content.to_string());
                file.last_synced = now_millis();
                file.clone()
            }
        };
        let revision = Revision {
            version: updated.version,
            content: content.to_string(),
            saved_at: updated.last_synced,
        };
        self.push_revision(&mut inner, id, revision);
        Ok(CasOutcome::Committed(updated))
    }

    fn remove_tree(&self, id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.lock();
        if !inner.files.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let removed = inner.descendants_first(id);
        for file_id in &removed {
            inner.files.remove(file_id);
            inner.revisions.remove(file_id);
        }
        Ok(removed)
    }

    fn list(&self, project_id: Option<Uuid>, parent_id: Option<Uuid>) -> Result<Vec<File>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .files
            .values()
            .filter(|f| project_id.is_none_or(|p| f.project_id == p))
            .filter(|f| parent_id.is_none() || f.parent_id == parent_id)
            .cloned()
            .collect())
    }

    fn revisions(&self, id: Uuid) -> Result<Vec<Revision>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .revisions
            .get(&id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn compact_revisions(&self, id: Uuid, keep_last: usize) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let Some(history) = inner.revisions.get_mut(&id) else {
            return Ok(0);
        };
        let mut removed = 0;
        while history.len() > keep_last {
            history.pop_front();
            removed += 1;
        }
        Ok(removed)
    }
}

impl SessionStore for MemoryStore {
    fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    fn remove_session(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock().sessions.remove(&id).is_some())
    }

    fn stale_sessions(&self, cutoff: u64) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.last_active() <= cutoff)
            .map(|s| s.id)
            .collect())
    }
}
