//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle with the Hello/Welcome handshake; reconnecting
//!   resumes the previous session
//! - Typed request/reply calls, matched by request id, with a timeout
//! - Server pushes (roster, file saved) as [`ClientEvent`]s
//! - [`SaveTransport`] so a [`ClientSyncAgent`](crate::agent::ClientSyncAgent)
//!   can save through it

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::agent::SaveTransport;
use crate::model::{
    Collaborator, ConflictResult, Cursor, File, NewFile, OpenFileEntry, Revision, Session,
};
use crate::protocol::{
    Envelope, Notification, ProtocolError, Request, Response, STATUS_BAD_REQUEST,
    STATUS_CONFLICT, STATUS_NOT_FOUND, STATUS_UNAVAILABLE,
};
use crate::service::SyncError;
use crate::storage::StoreError;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<(u16, Response)>>>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for a reply (default: 10s)
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Who this client is, sent in the Hello.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub is_host: bool,
}

impl ClientIdentity {
    pub fn new(project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            is_host: false,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { session: Session },
    Disconnected,
    /// Other collaborators of the project (own session already removed)
    RosterChanged(Vec<Collaborator>),
    FileSaved { file_id: Uuid, version: u64, session_id: Uuid },
}

/// The sync client.
pub struct SyncClient {
    identity: ClientIdentity,
    server_url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Session from the last Welcome; reused to resume
    session: RwLock<Option<Session>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    /// Bumped per `connect`; a stale reader task must not touch state
    generation: Arc<AtomicU64>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl SyncClient {
    pub fn new(identity: ClientIdentity, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: RwLock::new(None),
            outgoing_tx: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Connect and perform the handshake. A client that was connected
    /// before asks the server to resume its previous session.
    pub async fn connect(&self) -> Result<Session, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        *self.outgoing_tx.write().await = Some(out_tx);

        // Reader task: route replies to callers, pushes to the event channel
        let pending = Arc::clone(&self.pending);
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        let generation = current.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Envelope::decode(&data) {
                        Ok(Envelope::Reply { id, status, response }) => {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send((status, response));
                            }
                        }
                        Ok(Envelope::Notify(notification)) => {
                            let event = match notification {
                                Notification::RosterChanged { collaborators, .. } => {
                                    ClientEvent::RosterChanged(collaborators)
                                }
                                Notification::FileSaved { file_id, version, session_id } => {
                                    ClientEvent::FileSaved { file_id, version, session_id }
                                }
                            };
                            let _ = event_tx.send(event);
                        }
                        Ok(other) => log::debug!("Ignoring unexpected frame: {other:?}"),
                        Err(e) => log::warn!("Failed to decode frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            // Connection lost: callers waiting for replies see a closed channel
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected);
        });

        let resume = self.session.read().await.as_ref().map(|s| s.id);
        let hello = Request::Hello {
            user_id: self.identity.user_id,
            project_id: self.identity.project_id,
            name: self.identity.name.clone(),
            is_host: self.identity.is_host,
            resume,
        };

        let session = match self.call(hello).await {
            Ok((_, Response::Welcome { session })) => session,
            Ok((status, response)) => {
                self.disconnect().await;
                return Err(ProtocolError::UnexpectedFrame(format!(
                    "Handshake rejected ({status}): {response:?}"
                )));
            }
            Err(_) => {
                self.disconnect().await;
                return Err(ProtocolError::Timeout);
            }
        };

        *self.session.write().await = Some(session.clone());
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected {
            session: session.clone(),
        });
        log::info!(
            "Connected to {} as session {} (resumed: {})",
            self.server_url,
            session.id,
            resume == Some(session.id)
        );
        Ok(session)
    }

    /// Close the connection. The session is kept for the next `connect`.
    pub async fn disconnect(&self) {
        // Dropping the sender ends the writer task, which sends Close.
        self.outgoing_tx.write().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a request and wait for its reply.
    async fn call(&self, request: Request) -> Result<(u16, Response), SyncError> {
        let sender = self
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::Transient("Not connected".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = Envelope::request(id, request)
            .encode()
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if sender.send(encoded).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(SyncError::Transient(ProtocolError::ConnectionClosed.to_string()));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::Transient(ProtocolError::ConnectionClosed.to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SyncError::Transient(ProtocolError::Timeout.to_string()))
            }
        }
    }

    pub async fn create_file(&self, new: NewFile) -> Result<File, SyncError> {
        match self.call(Request::CreateFile(new)).await? {
            (_, Response::File(file)) => Ok(file),
            (status, response) => Err(reply_error(status, response, Uuid::nil())),
        }
    }

    pub async fn get_file(&self, id: Uuid) -> Result<File, SyncError> {
        match self.call(Request::GetFile { id }).await? {
            (_, Response::File(file)) => Ok(file),
            (status, response) => Err(reply_error(status, response, id)),
        }
    }

    pub async fn update_file(&self, id: Uuid, content: &str, version: u64) -> Result<File, SyncError> {
        let request = Request::UpdateFile {
            id,
            content: content.to_string(),
            version,
        };
        match self.call(request).await? {
            (_, Response::File(file)) => Ok(file),
            (status, response) => match reply_error(status, response, id) {
                SyncError::VersionConflict { mut conflict, server_file } => {
                    conflict.attempted_version = version;
                    conflict.attempted_content = content.to_string();
                    Err(SyncError::VersionConflict { conflict, server_file })
                }
                other => Err(other),
            },
        }
    }

    /// Returns the removed ids, children before parents.
    pub async fn delete_file(&self, id: Uuid) -> Result<Vec<Uuid>, SyncError> {
        match self.call(Request::DeleteFile { id }).await? {
            (_, Response::Deleted { removed, .. }) => Ok(removed),
            (status, response) => Err(reply_error(status, response, id)),
        }
    }

    pub async fn list_files(
        &self,
        project_id: Option<Uuid>,
        parent_id: Option<Uuid>,
    ) -> Result<Vec<File>, SyncError> {
        match self.call(Request::ListFiles { project_id, parent_id }).await? {
            (_, Response::Files(files)) => Ok(files),
            (status, response) => Err(reply_error(status, response, Uuid::nil())),
        }
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<Revision>, SyncError> {
        match self.call(Request::History { id }).await? {
            (_, Response::History(revisions)) => Ok(revisions),
            (status, response) => Err(reply_error(status, response, id)),
        }
    }

    pub async fn open_file(&self, file_id: Uuid, version: Option<u64>) -> Result<(), SyncError> {
        self.expect_ack(Request::OpenFile { file_id, version }).await?;
        self.apply_local(|session| {
            session.open(file_id, version);
        })
        .await;
        Ok(())
    }

    pub async fn close_file(&self, file_id: Uuid) -> Result<(), SyncError> {
        self.expect_ack(Request::CloseFile { file_id }).await?;
        self.apply_local(|session| {
            session.close(file_id);
        })
        .await;
        Ok(())
    }

    pub async fn update_cursor(&self, file_id: Uuid, cursor: Cursor) -> Result<(), SyncError> {
        self.expect_ack(Request::UpdateCursor { file_id, cursor }).await?;
        self.apply_local(|session| session.open(file_id, None).cursor = cursor).await;
        Ok(())
    }

    /// Other collaborators of the project.
    pub async fn roster(&self) -> Result<Vec<Collaborator>, SyncError> {
        match self.call(Request::Roster).await? {
            (_, Response::Roster(collaborators)) => Ok(collaborators),
            (status, response) => Err(reply_error(status, response, Uuid::nil())),
        }
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        match self.call(Request::Ping).await? {
            (_, Response::Pong) => Ok(()),
            (status, response) => Err(reply_error(status, response, Uuid::nil())),
        }
    }

    async fn expect_ack(&self, request: Request) -> Result<(), SyncError> {
        let subject = self.session.read().await.as_ref().map_or(Uuid::nil(), |s| s.id);
        match self.call(request).await? {
            (_, Response::Ack) => Ok(()),
            (status, response) => Err(reply_error(status, response, subject)),
        }
    }

    /// Mirror an acknowledged change on the local session copy.
    async fn apply_local(&self, f: impl FnOnce(&mut Session)) {
        if let Some(session) = self.session.write().await.as_mut() {
            f(session);
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Session from the last handshake, with every acknowledged open, close
    /// and cursor move applied since.
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Open files of the current session, as the server last confirmed.
    pub async fn open_files(&self) -> Vec<OpenFileEntry> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.open_files.clone())
            .unwrap_or_default()
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl SaveTransport for SyncClient {
    async fn save(&self, file_id: Uuid, content: String, base_version: u64) -> Result<File, SyncError> {
        self.update_file(file_id, &content, base_version).await
    }
}

/// Turn a non-success reply back into the error the server raised.
fn reply_error(status: u16, response: Response, subject: Uuid) -> SyncError {
    match (status, response) {
        (STATUS_CONFLICT, Response::Conflict { server_file, .. }) => SyncError::VersionConflict {
            conflict: ConflictResult {
                file_id: server_file.id,
                attempted_version: 0,
                attempted_content: String::new(),
                server_version: server_file.version,
                server_content: server_file.text().to_string(),
            },
            server_file: Box::new(server_file),
        },
        (STATUS_NOT_FOUND, _) => SyncError::NotFound(subject),
        (STATUS_BAD_REQUEST, Response::Error { message }) => SyncError::Validation(message),
        (STATUS_UNAVAILABLE, Response::Error { message }) => SyncError::Transient(message),
        (_, Response::Error { message }) => SyncError::Storage(StoreError::DatabaseError(message)),
        (status, other) => SyncError::Validation(format!("Unexpected reply ({status}): {other:?}")),
    }
}
