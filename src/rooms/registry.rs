//! In-memory room registry: which live channels are in which room.
//!
//! Every room entry sits behind its own async mutex. Presence and relay
//! hold it for the whole mutate-then-notify step, which serializes events
//! for one room without any cross-room lock.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, mpsc, mpsc::error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

use super::msg::{PeerAddress, RosterEntry, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Sending half of one client channel.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: ConnId,
    tx: mpsc::Sender<ServerEvent>,
}

impl PeerHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                conn_id: ConnId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue an event without waiting. Signaling is lossy: a full or closed
    /// queue drops the event.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                debug!(conn_id = %self.conn_id, event = event.name(), "dropping event for slow peer");
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!(conn_id = %self.conn_id, event = event.name(), "dropping event for closed peer");
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct Peer {
    pub user_id: i64,
    pub username: String,
    handle: PeerHandle,
}

impl Peer {
    pub fn conn_id(&self) -> ConnId {
        self.handle.conn_id
    }
}

/// Outcome of admitting a channel into a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The user was not in the room.
    New,
    /// The user was present on another channel; that channel was replaced.
    Reattached { previous: ConnId },
    /// The same channel joined again.
    Duplicate,
}

/// Live peers of one room, in join order. At most one peer per user.
#[derive(Debug)]
pub struct RoomPeers {
    room_id: String,
    peers: Vec<Peer>,
}

impl RoomPeers {
    fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_owned(),
            peers: Vec::new(),
        }
    }

    pub fn admit(&mut self, user_id: i64, username: &str, handle: PeerHandle) -> Admission {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.user_id == user_id) {
            let previous = peer.conn_id();
            peer.username = username.to_owned();
            if previous == handle.conn_id {
                return Admission::Duplicate;
            }
            peer.handle = handle;
            return Admission::Reattached { previous };
        }

        self.peers.push(Peer {
            user_id,
            username: username.to_owned(),
            handle,
        });
        info!(
            room_id = %self.room_id,
            user_id,
            peers = self.peers.len(),
            "peer admitted"
        );
        Admission::New
    }

    pub fn remove_conn(&mut self, conn_id: ConnId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.conn_id() == conn_id)?;
        let peer = self.peers.remove(index);
        info!(
            room_id = %self.room_id,
            user_id = peer.user_id,
            peers = self.peers.len(),
            "peer removed"
        );
        Some(peer)
    }

    pub fn peer(&self, conn_id: ConnId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.conn_id() == conn_id)
    }

    pub fn contains_conn(&self, conn_id: ConnId) -> bool {
        self.peer(conn_id).is_some()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.peers
            .iter()
            .map(|p| RosterEntry {
                user_id: p.user_id,
                username: p.username.clone(),
            })
            .collect()
    }

    /// Send to every peer except `except`. Returns how many were queued.
    pub fn broadcast(&self, event: &ServerEvent, except: Option<ConnId>) -> usize {
        self.peers
            .iter()
            .filter(|p| Some(p.conn_id()) != except)
            .filter(|p| p.handle.send(event.clone()))
            .count()
    }

    /// Send to peers addressed by `target`, never to `except`.
    pub fn send_to(&self, target: &PeerAddress, event: &ServerEvent, except: Option<ConnId>) -> usize {
        self.peers
            .iter()
            .filter(|p| Some(p.conn_id()) != except)
            .filter(|p| target.matches(p.user_id, &p.username))
            .filter(|p| p.handle.send(event.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

pub type RoomEntry = Arc<AsyncMutex<RoomPeers>>;

#[derive(Clone, Default)]
pub struct Registry {
    rooms: Arc<Mutex<HashMap<String, RoomEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<String, RoomEntry>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry for `room_id`, created empty if absent.
    pub fn room(&self, room_id: &str) -> RoomEntry {
        self.rooms()
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(RoomPeers::new(room_id))))
            .clone()
    }

    pub fn existing(&self, room_id: &str) -> Option<RoomEntry> {
        self.rooms().get(room_id).cloned()
    }

    /// Drop the entry for `room_id` if it is empty and nobody else holds it.
    /// Callers must release their own clone of the entry first.
    pub fn prune(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms();
        let removable = rooms.get(room_id).is_some_and(|entry| {
            Arc::strong_count(entry) == 1 && entry.try_lock().is_ok_and(|peers| peers.is_empty())
        });
        if removable {
            rooms.remove(room_id);
            debug!(room_id, "pruned empty room entry");
        }
        removable
    }

    pub async fn peer_count(&self, room_id: &str) -> usize {
        let Some(entry) = self.existing(room_id) else {
            return 0;
        };
        let count = entry.lock().await.len();
        count
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms().keys().cloned().collect()
    }
}
