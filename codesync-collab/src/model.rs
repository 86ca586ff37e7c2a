//! Persisted and derived entities shared by the server, the client agent
//! and the presence tracker.
//!
//! ```text
//! Project ── File (folder) ── File (file, content + version)
//!    │
//!    └── Session ── OpenFileEntry { file_id, version, cursor }
//!                        │
//!                        ▼
//!                  Collaborator (derived, broadcast only)
//! ```

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Whether a tree node carries content or only children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Folder,
}

/// A node of a project's source tree.
///
/// `content` is `Some` exactly when `kind == FileKind::File`. Listings
/// strip it (see [`File::without_content`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Parent folder (None = project root)
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub kind: FileKind,
    pub content: Option<String>,
    /// Editor language hint, e.g. "move"
    pub language: Option<String>,
    /// Concurrency token: starts at 1, +1 per committed update
    pub version: u64,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Time of the last committed write (unix millis)
    pub last_synced: u64,
}

impl File {
    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }

    /// Content as a string slice; folders yield "".
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Copy of this record with the content dropped, for listings.
    pub fn without_content(&self) -> Self {
        Self {
            content: None,
            ..self.clone()
        }
    }
}

/// Input of `create_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub project_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub kind: FileKind,
    pub content: Option<String>,
    pub language: Option<String>,
}

impl NewFile {
    /// A text file at the given location.
    pub fn file(
        project_id: Uuid,
        parent_id: Option<Uuid>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            parent_id,
            name: name.into(),
            kind: FileKind::File,
            content: Some(content.into()),
            language: None,
        }
    }

    /// A folder at the given location.
    pub fn folder(project_id: Uuid, parent_id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self {
            project_id,
            parent_id,
            name: name.into(),
            kind: FileKind::Folder,
            content: None,
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// One committed version of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: u64,
    pub content: String,
    /// Commit time (unix millis)
    pub saved_at: u64,
}

/// Caret position inside a file, 1-based like the editor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

impl Cursor {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

/// A file a session has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFileEntry {
    pub file_id: Uuid,
    /// Last version the client reported; a hint, never authoritative.
    pub version: Option<u64>,
    pub cursor: Cursor,
}

/// A user's connection to a project. Persisted so it can be resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub is_host: bool,
    /// Each file_id appears at most once.
    pub open_files: Vec<OpenFileEntry>,
    pub created_at: u64,
    pub updated_at: u64,
    /// When the last connection left (unix millis); None while connected
    pub disconnected_at: Option<u64>,
}

impl Session {
    pub fn new(user_id: Uuid, project_id: Uuid, name: impl Into<String>, is_host: bool) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            user_id,
            project_id,
            name: name.into(),
            is_host,
            open_files: Vec::new(),
            created_at: now,
            updated_at: now,
            disconnected_at: None,
        }
    }

    /// Last moment the session was known to be in use (unix millis).
    ///
    /// Falls back to `updated_at` for documents left behind without a clean
    /// disconnect.
    pub fn last_active(&self) -> u64 {
        self.disconnected_at.unwrap_or(self.updated_at)
    }

    pub fn entry(&self, file_id: Uuid) -> Option<&OpenFileEntry> {
        self.open_files.iter().find(|e| e.file_id == file_id)
    }

    /// Add the file if absent, otherwise refresh its version hint.
    /// An existing cursor is kept.
    pub fn open(&mut self, file_id: Uuid, version: Option<u64>) -> &mut OpenFileEntry {
        self.updated_at = now_millis();
        let idx = match self.open_files.iter().position(|e| e.file_id == file_id) {
            Some(idx) => {
                if version.is_some() {
                    self.open_files[idx].version = version;
                }
                idx
            }
            None => {
                self.open_files.push(OpenFileEntry {
                    file_id,
                    version,
                    cursor: Cursor::default(),
                });
                self.open_files.len() - 1
            }
        };
        &mut self.open_files[idx]
    }

    /// Remove the entry. Returns whether it was present.
    pub fn close(&mut self, file_id: Uuid) -> bool {
        let before = self.open_files.len();
        self.open_files.retain(|e| e.file_id != file_id);
        self.updated_at = now_millis();
        self.open_files.len() != before
    }
}

/// Presence of one live session as other participants see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// `#rrggbb`, stable per user
    pub color: String,
    pub focused_file: Option<Uuid>,
    pub cursor: Option<Cursor>,
    pub is_host: bool,
}

/// Outcome of a failed version check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResult {
    pub file_id: Uuid,
    pub attempted_version: u64,
    pub attempted_content: String,
    pub server_version: u64,
    pub server_content: String,
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
