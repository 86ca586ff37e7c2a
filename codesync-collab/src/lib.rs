//! # codesync-collab: file sync with optimistic concurrency
//!
//! Several editors work on the same project files. Every save carries the
//! version the editor last saw; the server accepts it only if that version
//! is still current, otherwise the editor gets a structured conflict.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐                      ┌─────────────────┐
//! │ ClientSyncAgent │ debounced save       │ SyncServer      │
//! │ (per open file) │ ──► SyncClient ────► │ (WebSocket)     │
//! └─────────────────┘     Binary Proto     └────────┬────────┘
//!                                                    │
//!                          ┌─────────────────────────┼──────────────┐
//!                          ▼                         ▼              ▼
//!                  ┌─────────────────┐   ┌──────────────────┐ ┌──────────┐
//!                  │ FileSyncService │   │ SessionPresence  │ │ Broadcast│
//!                  │ (CAS updates)   │   │ Manager (roster) │ │ (fan-out)│
//!                  └────────┬────────┘   └────────┬─────────┘ └──────────┘
//!                           └──────── LazyStore ──┘
//!                                  (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Files, revisions, sessions, collaborators
//! - [`storage`]: Version store with atomic compare-and-set
//! - [`service`]: File CRUD and version-checked updates
//! - [`agent`]: Client-side debounced save state machine
//! - [`presence`]: Sessions, open files, cursors and rosters
//! - [`protocol`]: Binary wire protocol (bincode-encoded Envelope)
//! - [`broadcast`]: Per-project fan-out
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket RPC client

pub mod agent;
pub mod broadcast;
pub mod client;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use agent::{
    AgentConfig, AgentEvent, ClientSyncAgent, OpenFiles, Resolution, SaveTransport, SyncState,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ClientConfig, ClientEvent, ClientIdentity, ConnectionState, SyncClient};
pub use model::{
    Collaborator, ConflictResult, Cursor, File, FileKind, NewFile, OpenFileEntry, Revision, Session,
};
pub use presence::SessionPresenceManager;
pub use protocol::{Envelope, Notification, ProtocolError, Request, Response};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{FileSyncService, SyncError};
pub use storage::{CasOutcome, LazyStore, MemoryStore, RocksStore, StoreConfig, StoreError};
