//! Binary RPC protocol between editor clients and the sync server.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`Envelope`]:
//! ```text
//! client ──► Request { id, Hello{..} }           (must be first)
//! client ◄── Reply   { id, 200, Welcome{..} }
//! client ──► Request { id, UpdateFile{..} }
//! client ◄── Reply   { id, 200 | 409 | 404, .. }
//! client ◄── Notify  (RosterChanged | FileSaved)  (any time)
//! ```
//! Replies echo the request id; ids are chosen by the client and only
//! need to be unique per connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Collaborator, Cursor, File, NewFile, Revision, Session};
use crate::service::SyncError;

pub const STATUS_OK: u16 = 200;
pub const STATUS_CREATED: u16 = 201;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Client → server operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Join a project, or resume a previous session.
    Hello {
        user_id: Uuid,
        project_id: Uuid,
        name: String,
        is_host: bool,
        resume: Option<Uuid>,
    },
    CreateFile(NewFile),
    GetFile { id: Uuid },
    UpdateFile { id: Uuid, content: String, version: u64 },
    DeleteFile { id: Uuid },
    ListFiles { project_id: Option<Uuid>, parent_id: Option<Uuid> },
    History { id: Uuid },
    OpenFile { file_id: Uuid, version: Option<u64> },
    CloseFile { file_id: Uuid },
    UpdateCursor { file_id: Uuid, cursor: Cursor },
    /// Collaborators of the caller's project, caller excluded.
    Roster,
    Ping,
}

/// Server → client reply bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Welcome { session: Session },
    File(File),
    Deleted { success: bool, removed: Vec<Uuid> },
    Files(Vec<File>),
    History(Vec<Revision>),
    Roster(Vec<Collaborator>),
    Ack,
    Pong,
    /// 409 body: the authoritative copy the client lost to.
    Conflict { error: String, server_file: File },
    Error { message: String },
}

impl Response {
    /// Status and body for a failed operation.
    pub fn from_error(err: &SyncError) -> (u16, Response) {
        let body = match err {
            SyncError::VersionConflict { server_file, .. } => Response::Conflict {
                error: "Version conflict".into(),
                server_file: (**server_file).clone(),
            },
            other => Response::Error {
                message: other.to_string(),
            },
        };
        (err.status(), body)
    }
}

/// Server pushes, fanned out per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    RosterChanged {
        project_id: Uuid,
        collaborators: Vec<Collaborator>,
    },
    /// A file got a new version; `session_id` made the save.
    FileSaved {
        file_id: Uuid,
        version: u64,
        session_id: Uuid,
    },
}

/// One WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    Request { id: u64, request: Request },
    Reply { id: u64, status: u16, response: Response },
    Notify(Notification),
}

impl Envelope {
    pub fn request(id: u64, request: Request) -> Self {
        Envelope::Request { id, request }
    }

    pub fn reply(id: u64, status: u16, response: Response) -> Self {
        Envelope::Reply { id, status, response }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A frame arrived that is not valid at this point of the exchange
    UnexpectedFrame(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(e) => write!(f, "Unexpected frame: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
