//! Session presence: who has which file open, and where their cursor is.
//!
//! ```text
//! open_file / update_cursor / close_file
//!       │
//!       ▼
//! live sessions (in memory) ──► Session document (SessionStore, best-effort)
//!       │
//!       ▼
//! Notification::RosterChanged ──► project BroadcastGroup ──► connections
//!                                                   (each drops its own entry)
//! ```
//!
//! Live entries exist only while a session is connected; the persisted
//! document outlives the connection so [`SessionPresenceManager::resume`]
//! can rebuild it. Documents idle for longer than the retention window are
//! dropped by [`SessionPresenceManager::purge_expired`] and can no longer be
//! resumed. Updates are last-write-wins in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::model::{now_millis, Collaborator, Cursor, OpenFileEntry, Session};
use crate::protocol::Notification;
use crate::service::SyncError;
use crate::storage::LazyStore;

/// How long a disconnected session stays resumable.
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Stable `#rrggbb` color for a user.
///
/// Hue comes from the id; saturation and lightness are fixed so every
/// color is vivid and readable on both light and dark editor themes.
pub fn color_for(user_id: Uuid) -> String {
    let hue = ((user_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A connected session.
struct LiveSession {
    session: Session,
    /// File the user last opened or moved the cursor in
    focused: Option<Uuid>,
    /// Connection order within the manager
    seq: u64,
    last_seen: Instant,
}

impl LiveSession {
    fn collaborator(&self) -> Collaborator {
        let session = &self.session;
        Collaborator {
            session_id: session.id,
            user_id: session.user_id,
            name: session.name.clone(),
            color: color_for(session.user_id),
            focused_file: self.focused,
            cursor: self.focused.and_then(|f| session.entry(f)).map(|e| e.cursor),
            is_host: session.is_host,
        }
    }
}

/// Tracks live sessions per project and publishes roster changes.
pub struct SessionPresenceManager {
    store: Arc<LazyStore>,
    live: RwLock<HashMap<Uuid, LiveSession>>,
    rooms: Arc<RoomManager>,
    next_seq: AtomicU64,
    retention: Duration,
}

impl SessionPresenceManager {
    pub fn new(store: Arc<LazyStore>, rooms: Arc<RoomManager>) -> Self {
        Self {
            store,
            live: RwLock::new(HashMap::new()),
            rooms,
            next_seq: AtomicU64::new(0),
            retention: DEFAULT_SESSION_RETENTION,
        }
    }

    /// Keep disconnected sessions resumable for `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Start a new session for a user in a project.
    pub async fn connect(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        name: impl Into<String>,
        is_host: bool,
    ) -> Session {
        let session = Session::new(user_id, project_id, name, is_host);
        let mut live = self.live.write().await;
        live.insert(session.id, self.live_entry(session.clone(), None));
        self.persist(&session).await;
        self.publish(&live, project_id).await;
        log::info!("Session {} ({}) joined project {project_id}", session.id, session.name);
        session
    }

    /// Rebuild the live entry of a previously persisted session.
    pub async fn resume(&self, session_id: Uuid) -> Result<Session, SyncError> {
        let mut live = self.live.write().await;
        if let Some(entry) = live.get_mut(&session_id) {
            entry.last_seen = Instant::now();
            return Ok(entry.session.clone());
        }

        let store = self
            .store
            .get()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        let mut session = store.get_session(session_id)?.ok_or(SyncError::NotFound(session_id))?;
        if session.last_active() <= self.retention_cutoff() {
            if let Err(e) = store.remove_session(session_id) {
                log::warn!("Failed to remove expired session {session_id}: {e}");
            }
            log::info!("Session {session_id} expired before it was resumed");
            return Err(SyncError::NotFound(session_id));
        }
        session.disconnected_at = None;
        self.persist(&session).await;

        let focused = session.open_files.last().map(|e| e.file_id);
        let project_id = session.project_id;
        live.insert(session_id, self.live_entry(session.clone(), focused));
        self.publish(&live, project_id).await;
        log::info!(
            "Session {session_id} resumed with {} open files",
            session.open_files.len()
        );
        Ok(session)
    }

    /// Add the file to the session (idempotent) and focus it.
    pub async fn open_file(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        known_version: Option<u64>,
    ) -> Result<OpenFileEntry, SyncError> {
        self.mutate(session_id, |entry| {
            entry.focused = Some(file_id);
            entry.session.open(file_id, known_version).clone()
        })
        .await
    }

    /// Remove the file from the session. Returns whether it was open.
    pub async fn close_file(&self, session_id: Uuid, file_id: Uuid) -> Result<bool, SyncError> {
        self.mutate(session_id, |entry| {
            let removed = entry.session.close(file_id);
            if entry.focused == Some(file_id) {
                entry.focused = entry.session.open_files.last().map(|e| e.file_id);
            }
            removed
        })
        .await
    }

    /// Move the cursor, opening the file first if needed.
    pub async fn update_cursor(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        cursor: Cursor,
    ) -> Result<(), SyncError> {
        log::trace!("Cursor of {session_id} in {file_id} at {}:{}", cursor.line, cursor.column);
        self.mutate(session_id, |entry| {
            entry.focused = Some(file_id);
            entry.session.open(file_id, None).cursor = cursor;
        })
        .await
    }

    /// Live collaborators of a project, excluding `caller`, in connection
    /// order.
    pub async fn roster(&self, project_id: Uuid, caller: Option<Uuid>) -> Vec<Collaborator> {
        let live = self.live.read().await;
        Self::build_roster(&live, project_id, caller)
    }

    /// Drop the live entry; the persisted session stays for resume until
    /// the retention window runs out.
    pub async fn disconnect(&self, session_id: Uuid) -> bool {
        let mut live = self.live.write().await;
        let Some(entry) = live.remove(&session_id) else {
            return false;
        };
        self.detach(entry.session.clone()).await;
        self.publish(&live, entry.session.project_id).await;
        log::info!("Session {session_id} left project {}", entry.session.project_id);
        true
    }

    /// Disconnect sessions with no activity for `timeout`.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<Uuid> {
        let mut live = self.live.write().await;
        let stale: Vec<(Uuid, Uuid)> = live
            .values()
            .filter(|entry| entry.last_seen.elapsed() > timeout)
            .map(|entry| (entry.session.id, entry.session.project_id))
            .collect();

        for (session_id, project_id) in &stale {
            if let Some(entry) = live.remove(session_id) {
                self.detach(entry.session).await;
            }
            self.publish(&live, *project_id).await;
            log::info!("Reaped idle session {session_id}");
        }
        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Delete persisted sessions idle for longer than the retention window.
    /// Live sessions are never purged.
    pub async fn purge_expired(&self) -> Vec<Uuid> {
        let store = match self.store.get().await {
            Ok(store) => store,
            Err(e) => {
                log::warn!("Skipping session purge: {e}");
                return Vec::new();
            }
        };
        // Held so a concurrent resume cannot revive a session mid-purge
        let live = self.live.read().await;
        let stale = match store.stale_sessions(self.retention_cutoff()) {
            Ok(stale) => stale,
            Err(e) => {
                log::warn!("Failed to scan sessions: {e}");
                return Vec::new();
            }
        };

        let mut purged = Vec::new();
        for session_id in stale.into_iter().filter(|id| !live.contains_key(id)) {
            match store.remove_session(session_id) {
                Ok(true) => purged.push(session_id),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to remove session {session_id}: {e}"),
            }
        }
        if !purged.is_empty() {
            log::info!("Purged {} expired sessions", purged.len());
        }
        purged
    }

    /// Record activity without changing anything else.
    pub async fn touch(&self, session_id: Uuid) -> bool {
        match self.live.write().await.get_mut(&session_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Current state of a live session.
    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.live.read().await.get(&session_id).map(|e| e.session.clone())
    }

    pub async fn is_live(&self, session_id: Uuid) -> bool {
        self.live.read().await.contains_key(&session_id)
    }

    /// Number of live sessions in a project.
    pub async fn session_count(&self, project_id: Uuid) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|e| e.session.project_id == project_id)
            .count()
    }

    /// Receiver for the project's notifications.
    pub async fn subscribe(&self, project_id: Uuid, session_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.rooms.get_or_create(project_id).await.add_member(session_id).await
    }

    /// Stop receiving a project's notifications; drops the room once empty.
    pub async fn unsubscribe(&self, project_id: Uuid, session_id: Uuid) {
        if let Some(room) = self.rooms.get(&project_id).await {
            room.remove_member(&session_id).await;
        }
        self.rooms.remove_if_empty(&project_id).await;
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn live_entry(&self, session: Session, focused: Option<Uuid>) -> LiveSession {
        LiveSession {
            session,
            focused,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            last_seen: Instant::now(),
        }
    }

    /// Apply `f` to a live session, persist it and publish the roster.
    async fn mutate<R>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(&mut LiveSession) -> R,
    ) -> Result<R, SyncError> {
        let mut live = self.live.write().await;
        let entry = live.get_mut(&session_id).ok_or(SyncError::NotFound(session_id))?;
        let result = f(entry);
        entry.last_seen = Instant::now();
        let session = entry.session.clone();

        self.persist(&session).await;
        self.publish(&live, session.project_id).await;
        Ok(result)
    }

    /// Persist a session that just lost its live entry.
    async fn detach(&self, mut session: Session) {
        session.disconnected_at = Some(now_millis());
        self.persist(&session).await;
    }

    /// Sessions last active at or before this instant (unix millis) are expired.
    fn retention_cutoff(&self) -> u64 {
        let window = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(window)
    }

    /// Best-effort: a failure is logged and never fails the caller.
    async fn persist(&self, session: &Session) {
        let result = match self.store.get().await {
            Ok(store) => store.put_session(session),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Failed to persist session {}: {e}", session.id);
        }
    }

    async fn publish(&self, live: &HashMap<Uuid, LiveSession>, project_id: Uuid) {
        let Some(room) = self.rooms.get(&project_id).await else {
            return;
        };
        let notification = Notification::RosterChanged {
            project_id,
            collaborators: Self::build_roster(live, project_id, None),
        };
        if let Err(e) = room.broadcast(notification) {
            log::error!("Failed to encode roster for {project_id}: {e}");
        }
    }

    fn build_roster(
        live: &HashMap<Uuid, LiveSession>,
        project_id: Uuid,
        caller: Option<Uuid>,
    ) -> Vec<Collaborator> {
        let mut entries: Vec<&LiveSession> = live
            .values()
            .filter(|e| e.session.project_id == project_id)
            .filter(|e| Some(e.session.id) != caller)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.collaborator()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File, Revision};
    use crate::protocol::Envelope;
    use crate::storage::{CasOutcome, SessionStore, StoreError, VersionStore};

    fn manager() -> SessionPresenceManager {
        SessionPresenceManager::new(Arc::new(LazyStore::memory()), Arc::new(RoomManager::new(64)))
    }

    #[test]
    fn test_color_is_stable_hex() {
        let user = Uuid::new_v4();
        let color = color_for(user);
        assert_eq!(color, color_for(user));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_primary_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert_eq!((to_byte(r), to_byte(g), to_byte(b)), (255, 0, 0));
    }

    #[tokio::test]
    async fn test_roster_excludes_caller_in_connection_order() {
        let presence = manager();
        let project = Uuid::new_v4();
        let alice = presence.connect(Uuid::new_v4(), project, "Alice", true).await;
        let bob = presence.connect(Uuid::new_v4(), project, "Bob", false).await;
        let carol = presence.connect(Uuid::new_v4(), project, "Carol", false).await;
        presence.connect(Uuid::new_v4(), Uuid::new_v4(), "Elsewhere", false).await;

        let roster = presence.roster(project, Some(bob.id)).await;
        let names: Vec<&str> = roster.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Carol"]);
        assert!(roster[0].is_host);
        assert_eq!(roster[0].session_id, alice.id);
        assert_eq!(roster[1].session_id, carol.id);
        assert_eq!(presence.roster(project, None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_update_cursor_opens_implicitly() {
        let presence = manager();
        let project = Uuid::new_v4();
        let a = presence.connect(Uuid::new_v4(), project, "A", false).await;
        let b = presence.connect(Uuid::new_v4(), project, "B", false).await;
        let file = Uuid::new_v4();

        presence.update_cursor(a.id, file, Cursor::new(10, 4)).await.unwrap();

        let session = presence.session(a.id).await.unwrap();
        assert_eq!(session.open_files.len(), 1);
        assert_eq!(session.entry(file).unwrap().cursor, Cursor::new(10, 4));

        let roster = presence.roster(project, Some(b.id)).await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].focused_file, Some(file));
        assert_eq!(roster[0].cursor, Some(Cursor::new(10, 4)));
    }

    #[tokio::test]
    async fn test_open_close_file() {
        let presence = manager();
        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        let f1 = Uuid::new_v4();
        let f2 = Uuid::new_v4();

        let entry = presence.open_file(s.id, f1, Some(2)).await.unwrap();
        assert_eq!(entry.cursor, Cursor::default());
        presence.open_file(s.id, f1, None).await.unwrap();
        presence.open_file(s.id, f2, None).await.unwrap();
        assert_eq!(presence.session(s.id).await.unwrap().open_files.len(), 2);

        assert!(presence.close_file(s.id, f2).await.unwrap());
        assert!(!presence.close_file(s.id, f2).await.unwrap());

        // Focus falls back to the remaining file
        let roster = presence.roster(s.project_id, None).await;
        assert_eq!(roster[0].focused_file, Some(f1));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let presence = manager();
        let err = presence.open_file(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(!presence.disconnect(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_disconnect_then_resume() {
        let presence = manager();
        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        let file = Uuid::new_v4();
        presence.update_cursor(s.id, file, Cursor::new(3, 7)).await.unwrap();

        assert!(presence.disconnect(s.id).await);
        assert!(!presence.is_live(s.id).await);
        assert!(presence.roster(s.project_id, None).await.is_empty());

        let resumed = presence.resume(s.id).await.unwrap();
        assert_eq!(resumed.entry(file).unwrap().cursor, Cursor::new(3, 7));
        let roster = presence.roster(s.project_id, None).await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].focused_file, Some(file));

        assert!(matches!(presence.resume(Uuid::new_v4()).await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_roster_changed_is_published() {
        let presence = manager();
        let project = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let mut rx = presence.subscribe(project, watcher).await;

        presence.connect(Uuid::new_v4(), project, "Alice", false).await;

        let bytes = rx.recv().await.unwrap();
        match Envelope::decode(&bytes).unwrap() {
            Envelope::Notify(Notification::RosterChanged { project_id, collaborators }) => {
                assert_eq!(project_id, project);
                assert_eq!(collaborators.len(), 1);
                assert_eq!(collaborators[0].name, "Alice");
            }
            other => panic!("Unexpected frame {other:?}"),
        }

        presence.unsubscribe(project, watcher).await;
        assert_eq!(presence.rooms().room_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle() {
        let presence = manager();
        let project = Uuid::new_v4();
        let idle = presence.connect(Uuid::new_v4(), project, "Idle", false).await;
        let active = presence.connect(Uuid::new_v4(), project, "Active", false).await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        presence.touch(active.id).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        let reaped = presence.reap_idle(Duration::from_secs(60)).await;
        assert_eq!(reaped, vec![idle.id]);
        assert!(presence.is_live(active.id).await);
        assert_eq!(presence.session_count(project).await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_marks_persisted_session() {
        let store = Arc::new(LazyStore::memory());
        let presence = SessionPresenceManager::new(Arc::clone(&store), Arc::new(RoomManager::new(16)));
        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        let sessions = store.get().await.unwrap();
        let disconnected_at = |id| sessions.get_session(id).unwrap().unwrap().disconnected_at;

        assert!(disconnected_at(s.id).is_none());
        presence.disconnect(s.id).await;
        assert!(disconnected_at(s.id).is_some());

        presence.resume(s.id).await.unwrap();
        assert!(disconnected_at(s.id).is_none());
        assert_eq!(presence.retention(), DEFAULT_SESSION_RETENTION);
    }

    #[tokio::test]
    async fn test_purge_expired_sessions() {
        let store = Arc::new(LazyStore::memory());
        let presence = SessionPresenceManager::new(Arc::clone(&store), Arc::new(RoomManager::new(16)))
            .with_retention(Duration::ZERO);
        let project = Uuid::new_v4();
        let gone = presence.connect(Uuid::new_v4(), project, "Gone", false).await;
        let staying = presence.connect(Uuid::new_v4(), project, "Staying", false).await;
        presence.disconnect(gone.id).await;

        assert_eq!(presence.purge_expired().await, vec![gone.id]);

        let sessions = store.get().await.unwrap();
        assert!(sessions.get_session(gone.id).unwrap().is_none());
        assert!(sessions.get_session(staying.id).unwrap().is_some());
        assert!(matches!(presence.resume(gone.id).await, Err(SyncError::NotFound(_))));
        assert!(presence.is_live(staying.id).await);
    }

    #[tokio::test]
    async fn test_resume_past_retention_is_not_found() {
        let store = Arc::new(LazyStore::memory());
        let presence = SessionPresenceManager::new(Arc::clone(&store), Arc::new(RoomManager::new(16)))
            .with_retention(Duration::ZERO);
        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        presence.disconnect(s.id).await;

        assert!(matches!(presence.resume(s.id).await, Err(SyncError::NotFound(_))));
        assert!(store.get().await.unwrap().get_session(s.id).unwrap().is_none());
        assert!(!presence.is_live(s.id).await);
    }

    #[tokio::test]
    async fn test_purge_keeps_sessions_within_retention() {
        let presence = manager();
        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        presence.disconnect(s.id).await;

        assert!(presence.purge_expired().await.is_empty());
        assert_eq!(presence.resume(s.id).await.unwrap().id, s.id);
    }

    /// Store whose session writes always fail.
    struct BrokenSessions;

    impl VersionStore for BrokenSessions {
        fn get(&self, _: Uuid) -> Result<Option<File>, StoreError> {
            Ok(None)
        }
        fn create(&self, _: &File) -> Result<(), StoreError> {
            Ok(())
        }
        fn update_if_version(&self, _: Uuid, _: &str, _: u64) -> Result<CasOutcome, StoreError> {
            Ok(CasOutcome::Missing)
        }
        fn remove_tree(&self, id: Uuid) -> Result<Vec<Uuid>, StoreError> {
            Err(StoreError::NotFound(id))
        }
        fn list(&self, _: Option<Uuid>, _: Option<Uuid>) -> Result<Vec<File>, StoreError> {
            Ok(Vec::new())
        }
        fn revisions(&self, _: Uuid) -> Result<Vec<Revision>, StoreError> {
            Ok(Vec::new())
        }
        fn compact_revisions(&self, _: Uuid, _: usize) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    impl SessionStore for BrokenSessions {
        fn put_session(&self, _: &Session) -> Result<(), StoreError> {
            Err(StoreError::DatabaseError("disk full".into()))
        }
        fn get_session(&self, _: Uuid) -> Result<Option<Session>, StoreError> {
            Ok(None)
        }
        fn remove_session(&self, _: Uuid) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn stale_sessions(&self, _: u64) -> Result<Vec<Uuid>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_presence() {
        let store = Arc::new(LazyStore::from_store(Arc::new(BrokenSessions)));
        let presence = SessionPresenceManager::new(store, Arc::new(RoomManager::new(16)));

        let s = presence.connect(Uuid::new_v4(), Uuid::new_v4(), "A", false).await;
        presence.update_cursor(s.id, Uuid::new_v4(), Cursor::new(2, 2)).await.unwrap();
        assert_eq!(presence.roster(s.project_id, None).await.len(), 1);
    }
}
