//! Forwarding of negotiation payloads and media status between the peers
//! of one room. Payloads are opaque and never persisted.

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    msg::{MediaStatus, Negotiation, PeerAddress, ServerEvent},
    registry::{ConnId, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    fn event(self, payload: Value, from_user: PeerAddress, target_user: Option<PeerAddress>) -> ServerEvent {
        match self {
            SignalKind::Offer => ServerEvent::WebrtcOffer {
                offer: payload,
                from_user,
                target_user,
            },
            SignalKind::Answer => ServerEvent::WebrtcAnswer {
                answer: payload,
                from_user,
                target_user,
            },
            SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate {
                candidate: payload,
                from_user,
                target_user,
            },
        }
    }
}

/// The sender as the relay sees it: its channel and, once joined, the
/// user bound to that channel.
#[derive(Debug, Clone, Copy)]
pub struct Sender {
    pub conn_id: ConnId,
    pub user_id: Option<i64>,
}

#[derive(Clone)]
pub struct Relay {
    registry: Registry,
}

impl Relay {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Forward an offer, answer or candidate. With a target only peers
    /// matching it receive the message; without one every other peer does.
    /// Returns how many peers the message was queued for.
    pub async fn negotiate(&self, sender: Sender, kind: SignalKind, msg: Negotiation) -> usize {
        let Negotiation {
            room_id,
            from_user,
            target_user,
            payload,
        } = msg;

        let Some(room_id) = room_id else {
            warn!(conn_id = %sender.conn_id, ?kind, "negotiation without room_id dropped");
            return 0;
        };
        let Some(payload) = payload else {
            warn!(conn_id = %sender.conn_id, %room_id, ?kind, "negotiation without payload dropped");
            return 0;
        };
        let Some(from_user) = from_user.or(sender.user_id.map(PeerAddress::Id)) else {
            warn!(conn_id = %sender.conn_id, %room_id, ?kind, "negotiation from unknown user dropped");
            return 0;
        };

        let event = kind.event(payload, from_user, target_user.clone());
        self.route(sender.conn_id, &room_id, target_user.as_ref(), &event).await
    }

    /// Fan a media toggle out to every other peer of the room.
    pub async fn media_status(&self, sender: Sender, msg: MediaStatus) -> usize {
        let Some(room_id) = msg.room_id else {
            warn!(conn_id = %sender.conn_id, "media status without room_id dropped");
            return 0;
        };
        let Some(user_id) = msg.user_id.or(sender.user_id.map(PeerAddress::Id)) else {
            warn!(conn_id = %sender.conn_id, %room_id, "media status without user_id dropped");
            return 0;
        };

        let event = ServerEvent::MediaStatusChange {
            user_id,
            audio_enabled: msg.audio_enabled,
            video_enabled: msg.video_enabled,
        };
        self.route(sender.conn_id, &room_id, None, &event).await
    }

    async fn route(&self, sender: ConnId, room_id: &str, target: Option<&PeerAddress>, event: &ServerEvent) -> usize {
        let Some(entry) = self.registry.existing(room_id) else {
            debug!(conn_id = %sender, room_id, event = event.name(), "no live room, dropped");
            return 0;
        };

        let delivered = {
            let peers = entry.lock().await;
            if !peers.contains_conn(sender) {
                warn!(conn_id = %sender, room_id, event = event.name(), "sender is not in room, dropped");
                0
            } else {
                match target {
                    Some(target) => peers.send_to(target, event, Some(sender)),
                    None => peers.broadcast(event, Some(sender)),
                }
            }
        };
        drop(entry);
        // a retirement that raced with this lookup may have skipped the prune
        self.registry.prune(room_id);

        if delivered == 0 {
            debug!(room_id, event = event.name(), target = ?target, "relayed to nobody");
        }
        delivered
    }
}
