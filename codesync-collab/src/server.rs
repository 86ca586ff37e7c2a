//! WebSocket sync server with per-project notification fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── FileSyncService ── LazyStore ── RocksDB
//!             ├── connection task ─┤                          │
//! Client B ──┘   (select! loop)   └── SessionPresenceManager ─┘
//!                     ▲                       │
//!                     │                       ▼
//!                     └──── BroadcastGroup (per project) ◄── FileSaved
//! ```
//!
//! Each connection:
//! - must open with `Hello`, answered by `Welcome{session}`
//! - then sends requests, each answered by exactly one `Reply`
//! - receives project notifications, minus its own session's entries
//!
//! A heartbeat task reaps sessions idle for longer than
//! `idle_timeout_secs`; a reaped session that speaks again is resumed.

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::model::Session;
use crate::presence::{SessionPresenceManager, DEFAULT_SESSION_RETENTION};
use crate::protocol::{
    Envelope, Notification, Request, Response, STATUS_BAD_REQUEST, STATUS_CREATED, STATUS_OK,
    STATUS_UNAVAILABLE,
};
use crate::service::{FileSyncService, SyncError};
use crate::storage::{LazyStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per project
    pub broadcast_capacity: usize,
    /// Interval of the idle-session reaper in seconds
    pub heartbeat_interval_secs: u64,
    /// Sessions without requests for this long leave the roster
    pub idle_timeout_secs: u64,
    /// Live sessions allowed per project
    pub max_sessions_per_project: usize,
    /// Disconnected sessions stay resumable this long, then get purged
    pub session_retention_secs: u64,
    /// RocksDB path (None = in-memory only). Only read by [`SyncServer::new`];
    /// [`SyncServer::with_store`] uses the handle it is given.
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 120,
            max_sessions_per_project: 100,
            session_retention_secs: DEFAULT_SESSION_RETENTION.as_secs(),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            heartbeat_interval_secs: 1,
            idle_timeout_secs: 60,
            max_sessions_per_project: 100,
            session_retention_secs: 3600,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub conflicts: u64,
    pub saves: u64,
    pub reaped_sessions: u64,
    pub purged_sessions: u64,
}

/// State shared by every connection task.
struct ServerShared {
    config: ServerConfig,
    store: Arc<LazyStore>,
    files: FileSyncService,
    presence: SessionPresenceManager,
    stats: RwLock<ServerStats>,
    /// Session id → connection currently serving it
    owners: RwLock<HashMap<Uuid, u64>>,
    next_connection: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<ServerShared>,
}

impl SyncServer {
    /// Create a server; the store opens on the first request.
    pub fn new(config: ServerConfig) -> Self {
        let store = match &config.storage_path {
            Some(path) => LazyStore::rocks(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            }),
            None => LazyStore::memory(),
        };
        Self::build(config, Arc::new(store))
    }

    /// Create a server over an existing store handle.
    pub fn with_store(config: ServerConfig, store: Arc<LazyStore>) -> Self {
        if let Some(path) = &config.storage_path {
            log::warn!("Ignoring storage_path {}; using the given store", path.display());
        }
        Self::build(config, store)
    }

    fn build(config: ServerConfig, store: Arc<LazyStore>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let retention = Duration::from_secs(config.session_retention_secs);
        Self {
            shared: Arc::new(ServerShared {
                files: FileSyncService::new(Arc::clone(&store)),
                presence: SessionPresenceManager::new(Arc::clone(&store), rooms)
                    .with_retention(retention),
                store,
                stats: RwLock::new(ServerStats::default()),
                owners: RwLock::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.shared.config.bind_addr.as_str()).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let reaper = tokio::spawn(Self::reap_loop(Arc::clone(&self.shared)));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("New TCP connection from {addr}");

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        reaper.abort();
        result
    }

    async fn reap_loop(shared: Arc<ServerShared>) {
        let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            shared.sweep().await;
        }
    }

    /// Flush buffered writes to disk. Call before the process exits.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.shared.store.sync()
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<ServerShared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = shared.next_connection.fetch_add(1, Ordering::Relaxed);

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let (id, request) = match Envelope::decode(&data) {
                                    Ok(Envelope::Request { id, request }) => (id, request),
                                    Ok(other) => {
                                        log::warn!("Unexpected frame from {addr}: {other:?}");
                                        continue;
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                shared.stats.write().await.total_requests += 1;

                                let reply = match &session {
                                    Some(current) => {
                                        let (status, response) = shared.dispatch(current, request).await;
                                        Envelope::reply(id, status, response)
                                    }
                                    None => match shared.handshake(request, connection_id).await {
                                        Ok(joined) => {
                                            broadcast_rx = Some(
                                                shared.presence.subscribe(joined.project_id, joined.id).await,
                                            );
                                            session = Some(joined.clone());
                                            Envelope::reply(id, STATUS_OK, Response::Welcome { session: joined })
                                        }
                                        Err((status, response)) => Envelope::reply(id, status, response),
                                    },
                                };
                                send_frame(&mut ws_sender, &reply).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Project notification
                    msg = async {
                        if let Some(ref mut rx) = broadcast_rx {
                            rx.recv().await
                        } else {
                            // Not joined yet
                            std::future::pending().await
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                let own = session.as_ref().map_or(Uuid::nil(), |s| s.id);
                                if let Some(frame) = filter_notification(&data, own) {
                                    ws_sender.send(Message::Binary(frame.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} lagged by {n} notifications");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup: leave the roster, keep the persisted session for resume.
        // A session resumed on a newer connection is left alone.
        if let Some(s) = session {
            let mut owners = shared.owners.write().await;
            if owners.get(&s.id) == Some(&connection_id) {
                owners.remove(&s.id);
                shared.presence.unsubscribe(s.project_id, s.id).await;
                shared.presence.disconnect(s.id).await;
            } else {
                log::debug!("Session {} moved to another connection", s.id);
            }
        }
        shared.stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn files(&self) -> &FileSyncService {
        &self.shared.files
    }

    pub fn presence(&self) -> &SessionPresenceManager {
        &self.shared.presence
    }
}

impl ServerShared {
    /// First frame of a connection: join or resume. The joined session is
    /// recorded as served by `connection_id`.
    /// One heartbeat: reap idle sessions, then purge expired documents.
    async fn sweep(&self) {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let reaped = self.presence.reap_idle(timeout).await;
        let purged = self.presence.purge_expired().await;
        if !reaped.is_empty() || !purged.is_empty() {
            let mut stats = self.stats.write().await;
            stats.reaped_sessions += reaped.len() as u64;
            stats.purged_sessions += purged.len() as u64;
        }
    }

    async fn handshake(&self, request: Request, connection_id: u64) -> Result<Session, (u16, Response)> {
        let Request::Hello { user_id, project_id, name, is_host, resume } = request else {
            return Err((
                STATUS_BAD_REQUEST,
                Response::Error {
                    message: "Expected Hello".into(),
                },
            ));
        };

        // Held until the owner is recorded so a closing connection cannot
        // tear down a session that is being resumed.
        let mut owners = self.owners.write().await;

        if let Some(previous) = resume {
            match self.presence.resume(previous).await {
                Ok(session) if session.project_id == project_id => {
                    owners.insert(session.id, connection_id);
                    return Ok(session);
                }
                Ok(_) => log::warn!("Session {previous} belongs to another project; starting fresh"),
                Err(e) => log::info!("Cannot resume {previous} ({e}); starting fresh"),
            }
        }

        if self.presence.session_count(project_id).await >= self.config.max_sessions_per_project {
            return Err((
                STATUS_UNAVAILABLE,
                Response::Error {
                    message: format!("Project {project_id} is full"),
                },
            ));
        }

        let session = self.presence.connect(user_id, project_id, name, is_host).await;
        owners.insert(session.id, connection_id);
        Ok(session)
    }

    /// Run one request for a joined session.
    async fn dispatch(&self, session: &Session, request: Request) -> (u16, Response) {
        if !self.presence.touch(session.id).await {
            // Reaped while idle; bring it back
            if let Err(e) = self.presence.resume(session.id).await {
                log::warn!("Failed to revive session {}: {e}", session.id);
            }
        }

        let result = match request {
            Request::Hello { .. } => Err(SyncError::Validation("Already joined".into())),
            Request::CreateFile(new) => self
                .files
                .create_file(new)
                .await
                .map(|f| (STATUS_CREATED, Response::File(f))),
            Request::GetFile { id } => self.files.get_file(id).await.map(|f| (STATUS_OK, Response::File(f))),
            Request::UpdateFile { id, content, version } => {
                self.update_file(session, id, &content, version).await
            }
            Request::DeleteFile { id } => self.files.delete_file(id).await.map(|removed| {
                (STATUS_OK, Response::Deleted { success: true, removed })
            }),
            Request::ListFiles { project_id, parent_id } => self
                .files
                .list_files(project_id, parent_id)
                .await
                .map(|files| (STATUS_OK, Response::Files(files))),
            Request::History { id } => self
                .files
                .history(id)
                .await
                .map(|revisions| (STATUS_OK, Response::History(revisions))),
            Request::OpenFile { file_id, version } => self
                .presence
                .open_file(session.id, file_id, version)
                .await
                .map(|_| (STATUS_OK, Response::Ack)),
            Request::CloseFile { file_id } => self
                .presence
                .close_file(session.id, file_id)
                .await
                .map(|_| (STATUS_OK, Response::Ack)),
            Request::UpdateCursor { file_id, cursor } => self
                .presence
                .update_cursor(session.id, file_id, cursor)
                .await
                .map(|_| (STATUS_OK, Response::Ack)),
            Request::Roster => {
                let roster = self.presence.roster(session.project_id, Some(session.id)).await;
                Ok((STATUS_OK, Response::Roster(roster)))
            }
            Request::Ping => Ok((STATUS_OK, Response::Pong)),
        };

        result.unwrap_or_else(|e| {
            log::debug!("Request from {} failed: {e}", session.id);
            Response::from_error(&e)
        })
    }

    async fn update_file(
        &self,
        session: &Session,
        id: Uuid,
        content: &str,
        version: u64,
    ) -> Result<(u16, Response), SyncError> {
        match self.files.update_file(id, content, version).await {
            Ok(file) => {
                self.stats.write().await.saves += 1;
                if let Some(room) = self.presence.rooms().get(&file.project_id).await {
                    let notification = Notification::FileSaved {
                        file_id: file.id,
                        version: file.version,
                        session_id: session.id,
                    };
                    if let Err(e) = room.broadcast(notification) {
                        log::error!("Failed to announce save of {id}: {e}");
                    }
                }
                Ok((STATUS_OK, Response::File(file)))
            }
            Err(e) => {
                if matches!(e, SyncError::VersionConflict { .. }) {
                    self.stats.write().await.conflicts += 1;
                }
                Err(e)
            }
        }
    }
}

/// Re-encode a project notification for one connection: its own roster
/// entry is removed and its own saves are not echoed.
fn filter_notification(data: &Arc<Vec<u8>>, own_session: Uuid) -> Option<Vec<u8>> {
    match Envelope::decode(data) {
        Ok(Envelope::Notify(Notification::RosterChanged { project_id, collaborators })) => {
            let others = collaborators
                .into_iter()
                .filter(|c| c.session_id != own_session)
                .collect();
            Envelope::Notify(Notification::RosterChanged {
                project_id,
                collaborators: others,
            })
            .encode()
            .ok()
        }
        Ok(Envelope::Notify(Notification::FileSaved { session_id, .. })) if session_id == own_session => None,
        _ => Some(data.to_vec()),
    }
}

async fn send_frame<S>(sink: &mut S, envelope: &Envelope) -> Result<(), BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = envelope.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
