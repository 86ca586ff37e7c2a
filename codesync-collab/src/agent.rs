//! Client-side save agent: one per open file.
//!
//! ```text
//!            edit                 timer fires              Ok
//!  Clean ──────────► Dirty ───────────────────► Saving ──────────► Clean
//!    ▲                 ▲ ▲                        │  │  (buffer changed
//!    │ AdoptServer     │ └── edit (re-arm) ───────┘  │   meanwhile → Dirty)
//!    │                 │                             │
//!  Conflict ◄──────────┼──── VersionConflict ────────┤
//!    │  ForceOverwrite │                             │ Transient / other
//!    └──► Saving       └──── edit / retry timer ── SaveFailed
//! ```
//!
//! Saves run on spawned tokio tasks, so [`ClientSyncAgent::update_content`]
//! never blocks the editor. At most one save per file is in flight; a
//! timer that fires meanwhile queues exactly one follow-up. The local
//! buffer is never replaced by the server copy except through an explicit
//! [`Resolution::AdoptServer`].
//!
//! All methods that arm timers must be called inside a tokio runtime.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::model::{ConflictResult, File};
use crate::service::SyncError;

/// Where an agent sends its saves: the service in-process, or
/// [`SyncClient`](crate::client::SyncClient) over the wire.
#[async_trait]
pub trait SaveTransport: Send + Sync + 'static {
    /// `update_file(file_id, content, base_version)`.
    async fn save(&self, file_id: Uuid, content: String, base_version: u64) -> Result<File, SyncError>;
}

/// Agent timing configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Quiet period after the last edit before a save (default: 3s)
    pub debounce: Duration,
    /// Delay before retrying a transient failure (default: 2s)
    pub retry_delay: Duration,
    /// Automatic retries after a transient failure (default: 3)
    pub max_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(3000),
            retry_delay: Duration::from_millis(2000),
            max_retries: 3,
        }
    }
}

impl AgentConfig {
    /// Short timings for tests against a real server.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            retry_delay: Duration::from_millis(20),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Buffer equals the last saved content
    Clean,
    /// Unsaved edits, timer armed (or cancelled while inactive)
    Dirty,
    /// A save is in flight
    Saving,
    /// The server rejected the base version; waiting for [`Resolution`]
    Conflict,
    /// Last save failed; still dirty
    SaveFailed,
}

/// Notifications emitted by agents.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Saved { file_id: Uuid, version: u64 },
    Conflict { file_id: Uuid, conflict: ConflictResult },
    SaveFailed { file_id: Uuid, error: String, will_retry: bool },
    RetriesExhausted { file_id: Uuid, attempts: u32 },
}

/// How to leave the [`SyncState::Conflict`] state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the buffer with the server copy.
    AdoptServer,
    /// Rebase on the server version and save the local buffer now.
    ForceOverwrite,
}

struct AgentInner {
    content: String,
    /// Bumped on every local edit
    edit_seq: u64,
    /// `edit_seq` of the content the server last acknowledged
    saved_seq: u64,
    known_version: u64,
    state: SyncState,
    /// `edit_seq` of the save in flight
    in_flight: Option<u64>,
    /// A timer fired while a save was in flight
    follow_up: bool,
    timer: Option<JoinHandle<()>>,
    /// Stale timers compare this and exit
    timer_generation: u64,
    conflict: Option<ConflictResult>,
    /// Consecutive transient failures
    attempts: u32,
    failure: Option<String>,
}

struct Shared {
    file_id: Uuid,
    transport: Arc<dyn SaveTransport>,
    config: AgentConfig,
    events: mpsc::UnboundedSender<AgentEvent>,
    inner: Mutex<AgentInner>,
    /// Signalled whenever a save completes
    settled: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AgentEvent) {
        // No receiver means nobody is listening; not an error.
        let _ = self.events.send(event);
    }

    fn stop_timer(inner: &mut AgentInner) {
        inner.timer_generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    fn arm(self: &Arc<Self>, inner: &mut AgentInner, delay: Duration) {
        Self::stop_timer(inner);
        let generation = inner.timer_generation;
        let shared = Arc::clone(self);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.on_timer(generation);
        }));
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.timer_generation != generation {
            return;
        }
        inner.timer = None;
        self.start_save(&mut inner);
    }

    fn start_save(self: &Arc<Self>, inner: &mut AgentInner) {
        if inner.state == SyncState::Conflict {
            return;
        }
        if inner.in_flight.is_some() {
            inner.follow_up = true;
            return;
        }
        if inner.edit_seq == inner.saved_seq {
            inner.state = SyncState::Clean;
            return;
        }

        inner.state = SyncState::Saving;
        let seq = inner.edit_seq;
        inner.in_flight = Some(seq);
        let content = inner.content.clone();
        let base_version = inner.known_version;
        log::debug!("Saving {} at base version {base_version}", self.file_id);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = shared.transport.save(shared.file_id, content, base_version).await;
            shared.on_complete(seq, result);
        });
    }

    fn on_complete(self: &Arc<Self>, seq: u64, result: Result<File, SyncError>) {
        let mut inner = self.lock();
        inner.in_flight = None;
        let follow_up = std::mem::take(&mut inner.follow_up);

        match result {
            Ok(file) => {
                inner.known_version = file.version;
                inner.saved_seq = seq;
                inner.attempts = 0;
                inner.failure = None;
                self.emit(AgentEvent::Saved {
                    file_id: self.file_id,
                    version: file.version,
                });
                if inner.edit_seq == seq {
                    inner.state = SyncState::Clean;
                } else {
                    // The pending edit timer is the follow-up, unless it
                    // already fired during the save.
                    inner.state = SyncState::Dirty;
                    if follow_up {
                        self.start_save(&mut inner);
                    }
                }
            }
            Err(SyncError::VersionConflict { mut conflict, .. }) => {
                log::info!(
                    "Conflict on {}: local base {}, server at {}",
                    self.file_id,
                    conflict.attempted_version,
                    conflict.server_version
                );
                Self::stop_timer(&mut inner);
                conflict.attempted_content = inner.content.clone();
                inner.state = SyncState::Conflict;
                inner.attempts = 0;
                inner.conflict = Some(conflict.clone());
                self.emit(AgentEvent::Conflict {
                    file_id: self.file_id,
                    conflict,
                });
            }
            Err(e) if e.is_transient() => {
                inner.attempts += 1;
                inner.failure = Some(e.to_string());
                inner.state = SyncState::SaveFailed;
                if inner.attempts <= self.config.max_retries {
                    log::warn!(
                        "Save of {} failed ({e}), retry {}/{}",
                        self.file_id,
                        inner.attempts,
                        self.config.max_retries
                    );
                    self.arm(&mut inner, self.config.retry_delay);
                    self.emit(AgentEvent::SaveFailed {
                        file_id: self.file_id,
                        error: e.to_string(),
                        will_retry: true,
                    });
                } else {
                    log::error!("Giving up on {} after {} attempts: {e}", self.file_id, inner.attempts);
                    Self::stop_timer(&mut inner);
                    self.emit(AgentEvent::RetriesExhausted {
                        file_id: self.file_id,
                        attempts: inner.attempts,
                    });
                }
            }
            Err(e) => {
                log::error!("Save of {} rejected: {e}", self.file_id);
                inner.failure = Some(e.to_string());
                inner.state = SyncState::SaveFailed;
                inner.attempts = 0;
                self.emit(AgentEvent::SaveFailed {
                    file_id: self.file_id,
                    error: e.to_string(),
                    will_retry: false,
                });
            }
        }

        drop(inner);
        self.settled.notify_waiters();
    }

    async fn wait_settled(&self) -> SyncState {
        loop {
            let notified = self.settled.notified();
            {
                let inner = self.lock();
                if inner.in_flight.is_none() {
                    return inner.state;
                }
            }
            notified.await;
        }
    }
}

/// Debounced, conflict-aware save state machine for one file.
pub struct ClientSyncAgent {
    shared: Arc<Shared>,
}

impl ClientSyncAgent {
    /// Start tracking `file` as last read from the server (Clean).
    pub fn new(
        file: &File,
        transport: Arc<dyn SaveTransport>,
        config: AgentConfig,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        let inner = AgentInner {
            content: file.text().to_string(),
            edit_seq: 0,
            saved_seq: 0,
            known_version: file.version,
            state: SyncState::Clean,
            in_flight: None,
            follow_up: false,
            timer: None,
            timer_generation: 0,
            conflict: None,
            attempts: 0,
            failure: None,
        };
        Self {
            shared: Arc::new(Shared {
                file_id: file.id,
                transport,
                config,
                events,
                inner: Mutex::new(inner),
                settled: Notify::new(),
            }),
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.shared.file_id
    }

    /// Record a local edit and (re)arm the debounce timer.
    ///
    /// In the Conflict state only the buffer changes.
    pub fn update_content(&self, text: impl Into<String>) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.content = text.into();
        inner.edit_seq += 1;

        match inner.state {
            SyncState::Conflict => {
                let content = inner.content.clone();
                if let Some(conflict) = inner.conflict.as_mut() {
                    conflict.attempted_content = content;
                }
            }
            SyncState::Saving => {
                shared.arm(&mut inner, shared.config.debounce);
            }
            SyncState::Clean | SyncState::Dirty | SyncState::SaveFailed => {
                inner.state = SyncState::Dirty;
                inner.attempts = 0;
                inner.failure = None;
                shared.arm(&mut inner, shared.config.debounce);
            }
        }
    }

    /// Save now instead of waiting for the timer, then wait until no save
    /// is in flight. Returns the resulting state.
    pub async fn flush(&self) -> SyncState {
        {
            let shared = &self.shared;
            let mut inner = shared.lock();
            Shared::stop_timer(&mut inner);
            inner.attempts = 0;
            shared.start_save(&mut inner);
        }
        self.shared.wait_settled().await
    }

    /// Drop the pending timer. An in-flight save still completes and the
    /// buffer stays dirty.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        Shared::stop_timer(&mut inner);
        inner.follow_up = false;
    }

    /// Arm the debounce timer again for a dirty buffer whose timer was
    /// cancelled. Returns whether a timer was armed.
    pub fn rearm(&self) -> bool {
        let shared = &self.shared;
        let mut inner = shared.lock();
        let idle = inner.timer.is_none() && inner.in_flight.is_none();
        let dirty = inner.edit_seq != inner.saved_seq;
        let resumable = matches!(inner.state, SyncState::Dirty | SyncState::SaveFailed);
        if idle && dirty && resumable {
            shared.arm(&mut inner, shared.config.debounce);
            true
        } else {
            false
        }
    }

    /// Leave the Conflict state. Returns false if there was no conflict.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        let shared = &self.shared;
        let mut inner = shared.lock();
        let Some(conflict) = inner.conflict.take() else {
            return false;
        };

        inner.known_version = conflict.server_version;
        match resolution {
            Resolution::AdoptServer => {
                inner.content = conflict.server_content;
                inner.edit_seq += 1;
                inner.saved_seq = inner.edit_seq;
                inner.state = SyncState::Clean;
            }
            Resolution::ForceOverwrite => {
                inner.state = SyncState::Dirty;
                shared.start_save(&mut inner);
            }
        }
        log::info!("Resolved conflict on {} with {resolution:?}", shared.file_id);
        true
    }

    /// Take a newer server copy (e.g. after a `FileSaved` push).
    ///
    /// Only a Clean buffer is replaced; a dirty one keeps its edits and
    /// will meet the new version as a conflict on its next save.
    pub fn apply_remote(&self, file: &File) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != SyncState::Clean
            || inner.in_flight.is_some()
            || file.version <= inner.known_version
        {
            return false;
        }
        inner.content = file.text().to_string();
        inner.known_version = file.version;
        inner.edit_seq += 1;
        inner.saved_seq = inner.edit_seq;
        true
    }

    /// Wait until no save is in flight.
    pub async fn settled(&self) -> SyncState {
        self.shared.wait_settled().await
    }

    pub fn content(&self) -> String {
        self.shared.lock().content.clone()
    }

    /// Whether the buffer holds edits the server has not acknowledged.
    pub fn is_dirty(&self) -> bool {
        let inner = self.shared.lock();
        inner.edit_seq != inner.saved_seq
    }

    /// The unresolved conflict, if any.
    pub fn error(&self) -> Option<ConflictResult> {
        self.shared.lock().conflict.clone()
    }

    /// Message of the last failed save, cleared by the next edit or success.
    pub fn failure(&self) -> Option<String> {
        self.shared.lock().failure.clone()
    }

    pub fn state(&self) -> SyncState {
        self.shared.lock().state
    }

    pub fn known_version(&self) -> u64 {
        self.shared.lock().known_version
    }
}

impl Drop for ClientSyncAgent {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        Shared::stop_timer(&mut inner);
    }
}

/// The files a client has open, one agent each, with one active file.
pub struct OpenFiles {
    transport: Arc<dyn SaveTransport>,
    config: AgentConfig,
    events: mpsc::UnboundedSender<AgentEvent>,
    agents: HashMap<Uuid, ClientSyncAgent>,
    active: Option<Uuid>,
}

impl OpenFiles {
    /// Returns the manager and the receiver for all agents' events.
    pub fn new(
        transport: Arc<dyn SaveTransport>,
        config: AgentConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let files = Self {
            transport,
            config,
            events,
            agents: HashMap::new(),
            active: None,
        };
        (files, rx)
    }

    /// Open `file` (if not yet open) and make it the active file.
    pub fn open(&mut self, file: &File) -> &ClientSyncAgent {
        if !self.agents.contains_key(&file.id) {
            let agent = ClientSyncAgent::new(
                file,
                Arc::clone(&self.transport),
                self.config.clone(),
                self.events.clone(),
            );
            self.agents.insert(file.id, agent);
        }
        self.activate(file.id);
        &self.agents[&file.id]
    }

    /// Switch the active file. The previous one's timer is cancelled; the
    /// new one's dirty buffer is re-armed.
    pub fn activate(&mut self, file_id: Uuid) -> bool {
        if !self.agents.contains_key(&file_id) {
            return false;
        }
        if self.active == Some(file_id) {
            return true;
        }
        if let Some(previous) = self.active.and_then(|id| self.agents.get(&id)) {
            previous.cancel();
        }
        self.active = Some(file_id);
        if let Some(agent) = self.agents.get(&file_id) {
            agent.rearm();
        }
        true
    }

    pub fn active(&self) -> Option<&ClientSyncAgent> {
        self.active.and_then(|id| self.agents.get(&id))
    }

    pub fn get(&self, file_id: Uuid) -> Option<&ClientSyncAgent> {
        self.agents.get(&file_id)
    }

    /// Flush and forget a file. Returns its final state.
    pub async fn close(&mut self, file_id: Uuid) -> Option<SyncState> {
        let state = self.agents.get(&file_id)?.flush().await;
        self.agents.remove(&file_id);
        if self.active == Some(file_id) {
            self.active = None;
        }
        Some(state)
    }

    /// Flush every open file, active or not.
    pub async fn flush_all(&self) -> Vec<(Uuid, SyncState)> {
        let mut results = Vec::with_capacity(self.agents.len());
        for (id, agent) in &self.agents {
            results.push((*id, agent.flush().await));
        }
        results
    }

    /// Files with unacknowledged edits.
    pub fn dirty_files(&self) -> Vec<Uuid> {
        self.agents
            .iter()
            .filter(|(_, agent)| agent.is_dirty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
