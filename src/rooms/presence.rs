//! Participant lifecycle: join, leave and disconnect.
//!
//! A join or a retirement holds the room's registry lock from the registry
//! mutation through the store bookkeeping to the notification fan-out, so
//! every peer of a room observes joins and departures in one order.
//!
//! Store writes on these paths are best-effort. Live presence is what the
//! registry says; a failed write is logged and the handler carries on.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{Room, Store, StoreError};

use super::{
    msg::{RosterEntry, ServerEvent},
    registry::{Admission, ConnId, PeerHandle, Registry},
};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Room {0} doesn't exist or has ended")]
    RoomNotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PresenceError {
    /// Message safe to send back over the channel.
    pub fn client_message(&self) -> String {
        match self {
            PresenceError::RoomNotFound(_) | PresenceError::Validation(_) => self.to_string(),
            PresenceError::Store(_) => "An internal error occurred".to_owned(),
        }
    }
}

/// Where one channel stands with respect to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// Channel open, not in any room.
    Connected,
    Joining,
    Active,
    Left,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Left,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub admission: Admission,
    /// Roster sent to the joiner, in join order, joiner included.
    pub roster: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: i64,
    pub username: String,
    pub reason: LeaveReason,
}

#[derive(Clone)]
pub struct Presence {
    store: Store,
    registry: Registry,
}

impl Presence {
    pub fn new(store: Store, registry: Registry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The active room `room_id`, or `RoomNotFound`. Reads only.
    pub async fn validate_room(&self, room_id: &str) -> Result<Room, PresenceError> {
        self.store
            .find_active_room(room_id)
            .await?
            .ok_or_else(|| PresenceError::RoomNotFound(room_id.to_owned()))
    }

    /// Admit `handle` into `room_id` as `(user_id, username)`.
    ///
    /// Other peers get `user_joined` (unless this exact channel was already
    /// admitted) and the joiner gets `room_users`, both computed under the
    /// room lock. An unknown or inactive room is rejected before anything
    /// is touched.
    #[instrument(skip(self, handle), fields(conn_id = %handle.conn_id()))]
    pub async fn join(
        &self,
        room_id: &str,
        user_id: i64,
        username: &str,
        handle: PeerHandle,
    ) -> Result<Joined, PresenceError> {
        self.validate_room(room_id).await?;

        let entry = self.registry.room(room_id);
        let joined = {
            let mut peers = entry.lock().await;
            let admission = peers.admit(user_id, username, handle.clone());

            self.record_participation(room_id, user_id).await;

            match admission {
                Admission::Duplicate => debug!("channel already in room, resending roster"),
                Admission::Reattached { previous } => {
                    info!(%previous, "user moved to a new channel");
                }
                Admission::New => {}
            }
            if admission != Admission::Duplicate {
                peers.broadcast(
                    &ServerEvent::UserJoined {
                        username: username.to_owned(),
                        user_id,
                    },
                    Some(handle.conn_id()),
                );
            }

            let roster = peers.roster();
            handle.send(ServerEvent::RoomUsers(roster.clone()));
            Joined { admission, roster }
        };

        info!(peers = joined.roster.len(), "user joined room");
        Ok(joined)
    }

    /// Open a participation row unless one is already open. Called with
    /// the room lock held.
    async fn record_participation(&self, room_id: &str, user_id: i64) {
        match self.store.open_participation_id(room_id, user_id).await {
            Ok(Some(existing)) => debug!(existing, "participation already open"),
            Ok(None) => {
                if let Err(err) = self.store.open_participation(room_id, user_id).await {
                    warn!(error = %err, "failed to record participation");
                }
            }
            Err(err) => warn!(error = %err, "failed to check for open participation"),
        }
    }

    /// Explicit leave of the channel `conn_id`.
    pub async fn leave(&self, room_id: &str, conn_id: ConnId) -> Option<Departure> {
        self.retire(room_id, conn_id, LeaveReason::Left).await
    }

    /// Cleanup after the channel `conn_id` dropped. A channel that is no
    /// longer in the room's registry entry has nothing to clean up, which
    /// makes repeated calls harmless.
    pub async fn disconnect(&self, room_id: &str, conn_id: ConnId) -> Option<Departure> {
        self.retire(room_id, conn_id, LeaveReason::Disconnected).await
    }

    #[instrument(skip(self))]
    async fn retire(&self, room_id: &str, conn_id: ConnId, reason: LeaveReason) -> Option<Departure> {
        let entry = self.registry.existing(room_id)?;
        let departure = {
            let mut peers = entry.lock().await;
            let Some(peer) = peers.remove_conn(conn_id) else {
                debug!("channel not in room, nothing to retire");
                return None;
            };

            if let Err(err) = self.store.close_participation(room_id, peer.user_id).await {
                warn!(error = %err, user_id = peer.user_id, "failed to record departure");
            }

            peers.broadcast(
                &ServerEvent::UserLeft {
                    username: peer.username.clone(),
                    user_id: peer.user_id,
                },
                None,
            );

            Departure {
                user_id: peer.user_id,
                username: peer.username,
                reason,
            }
        };
        drop(entry);
        self.registry.prune(room_id);

        info!(user_id = departure.user_id, ?reason, "user left room");
        Some(departure)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn setup() -> (Presence, i64, i64) {
        let store = Store::in_memory().await.unwrap();
        let alice = store.get_or_create_user("alice").await.unwrap();
        let bob = store.get_or_create_user("bob").await.unwrap();
        store.create_room("abc123", "Standup", alice).await.unwrap();
        (Presence::new(store, Registry::new()), alice, bob)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_unknown_room_has_no_side_effects() {
        let (presence, alice, _) = setup().await;
        let (handle, mut rx) = PeerHandle::channel(8);

        let err = presence.join("nope", alice, "alice", handle).await.unwrap_err();
        assert!(matches!(err, PresenceError::RoomNotFound(_)));
        assert_eq!(err.client_message(), "Room nope doesn't exist or has ended");

        assert!(presence.registry().existing("nope").is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_notifies_others_and_sends_roster() {
        let (presence, alice, bob) = setup().await;
        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b, mut b_rx) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a).await.unwrap();
        let joined = presence.join("abc123", bob, "bob", b).await.unwrap();
        assert_eq!(joined.admission, Admission::New);

        assert_eq!(
            drain(&mut a_rx),
            vec![
                ServerEvent::RoomUsers(vec![RosterEntry { user_id: alice, username: "alice".into() }]),
                ServerEvent::UserJoined { username: "bob".into(), user_id: bob },
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::RoomUsers(vec![
                RosterEntry { user_id: alice, username: "alice".into() },
                RosterEntry { user_id: bob, username: "bob".into() },
            ])]
        );
        assert_eq!(presence.store().count_active_participants("abc123").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_join_is_not_rebroadcast() {
        let (presence, alice, bob) = setup().await;
        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b, mut b_rx) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a).await.unwrap();
        presence.join("abc123", bob, "bob", b.clone()).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let again = presence.join("abc123", bob, "bob", b).await.unwrap();
        assert_eq!(again.admission, Admission::Duplicate);
        assert!(drain(&mut a_rx).is_empty());
        assert!(matches!(drain(&mut b_rx).as_slice(), [ServerEvent::RoomUsers(r)] if r.len() == 2));

        assert_eq!(presence.store().count_active_participants("abc123").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_leave_closes_participation_and_notifies() {
        let (presence, alice, bob) = setup().await;
        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b, _b_rx) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a).await.unwrap();
        presence.join("abc123", bob, "bob", b.clone()).await.unwrap();
        drain(&mut a_rx);

        let departure = presence.leave("abc123", b.conn_id()).await.unwrap();
        assert_eq!(departure.reason, LeaveReason::Left);
        assert_eq!(drain(&mut a_rx), vec![ServerEvent::UserLeft { username: "bob".into(), user_id: bob }]);

        let store = presence.store();
        assert_eq!(store.count_active_participants("abc123").await.unwrap(), 1);
        assert_eq!(presence.registry().peer_count("abc123").await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let (presence, alice, bob) = setup().await;
        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b, _b_rx) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a).await.unwrap();
        presence.join("abc123", bob, "bob", b.clone()).await.unwrap();
        drain(&mut a_rx);

        assert!(presence.disconnect("abc123", b.conn_id()).await.is_some());
        assert!(presence.disconnect("abc123", b.conn_id()).await.is_none());
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(presence.store().count_active_participants("abc123").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_departure_prunes_entry() {
        let (presence, alice, _) = setup().await;
        let (a, _a_rx) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a.clone()).await.unwrap();
        presence.disconnect("abc123", a.conn_id()).await.unwrap();

        assert!(presence.registry().existing("abc123").is_none());
        assert_eq!(presence.store().count_active_participants("abc123").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_channel_cleanup_after_reattach_keeps_user() {
        let (presence, alice, bob) = setup().await;
        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b_old, _b1) = PeerHandle::channel(8);
        let (b_new, _b2) = PeerHandle::channel(8);

        presence.join("abc123", alice, "alice", a).await.unwrap();
        presence.join("abc123", bob, "bob", b_old.clone()).await.unwrap();
        let joined = presence.join("abc123", bob, "bob", b_new).await.unwrap();
        assert_eq!(joined.admission, Admission::Reattached { previous: b_old.conn_id() });
        drain(&mut a_rx);

        // the replaced channel's own cleanup finds nothing
        assert!(presence.disconnect("abc123", b_old.conn_id()).await.is_none());
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(presence.registry().peer_count("abc123").await, 2);
        assert_eq!(presence.store().count_active_participants("abc123").await.unwrap(), 2);
    }
}
