//! Per-project fan-out of server notifications.
//!
//! Every connected session of a project subscribes to the project's
//! [`BroadcastGroup`]. Notifications are encoded once and shared as
//! `Arc<Vec<u8>>`; a receiver that falls more than `capacity` messages
//! behind loses the oldest ones (tokio broadcast lag semantics).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Envelope, Notification, ProtocolError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_members: usize,
}

/// Broadcast channel shared by the live sessions of one project.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Subscribed session ids
    members: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of messages buffered per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a session and return its receiver.
    pub async fn add_member(&self, session_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.members.write().await.insert(session_id);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, session_id: &Uuid) -> bool {
        self.members.write().await.remove(session_id)
    }

    /// Encode and send to every receiver. Filtering the sender out is the
    /// receiving connection's job.
    pub fn broadcast(&self, notification: Notification) -> Result<usize, ProtocolError> {
        let encoded = Envelope::Notify(notification).encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes. Returns the number of receivers.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, session_id: &Uuid) -> bool {
        self.members.read().await.contains(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps project ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a project.
    pub async fn get_or_create(&self, project_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&project_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&project_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(project_id, room.clone());
        room
    }

    /// The room of a project, if one exists.
    pub async fn get(&self, project_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(project_id).cloned()
    }

    /// Drop a room nobody is subscribed to.
    pub async fn remove_if_empty(&self, project_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(project_id) {
            if room.member_count().await == 0 {
                rooms.remove(project_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
