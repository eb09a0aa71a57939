//! Channel wire format: `{"event": "...", "data": ...}` JSON text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a client names another peer: a numeric user id, or a string that is
/// either a username or a user id in decimal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerAddress {
    Id(i64),
    Name(String),
}

impl PeerAddress {
    pub fn matches(&self, user_id: i64, username: &str) -> bool {
        match self {
            PeerAddress::Id(id) => *id == user_id,
            PeerAddress::Name(name) => name == username || name.parse::<i64>().is_ok_and(|id| id == user_id),
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddress::Id(id) => write!(f, "{id}"),
            PeerAddress::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinRoom {
    pub room_id: Option<String>,
    pub username: Option<String>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaveRoom {
    pub room_id: Option<String>,
}

/// Offer, answer or ICE candidate. The payload arrives under `offer`,
/// `answer` or `candidate` and is forwarded untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Negotiation {
    pub room_id: Option<String>,
    pub from_user: Option<PeerAddress>,
    pub target_user: Option<PeerAddress>,
    #[serde(alias = "offer", alias = "answer", alias = "candidate")]
    pub payload: Option<Value>,
}

/// Mic/camera toggle. `user_id` is a peer address like `from_user`, so a
/// numeric string is accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaStatus {
    pub room_id: Option<String>,
    pub user_id: Option<PeerAddress>,
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    WebrtcOffer(Negotiation),
    WebrtcAnswer(Negotiation),
    WebrtcIceCandidate(Negotiation),
    MediaStatusChange(MediaStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionSuccess {
        message: String,
    },
    UserJoined {
        username: String,
        user_id: i64,
    },
    UserLeft {
        username: String,
        user_id: i64,
    },
    RoomUsers(Vec<RosterEntry>),
    WebrtcOffer {
        offer: Value,
        from_user: PeerAddress,
        target_user: Option<PeerAddress>,
    },
    WebrtcAnswer {
        answer: Value,
        from_user: PeerAddress,
        target_user: Option<PeerAddress>,
    },
    WebrtcIceCandidate {
        candidate: Value,
        from_user: PeerAddress,
        target_user: Option<PeerAddress>,
    },
    MediaStatusChange {
        user_id: PeerAddress,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionSuccess { .. } => "connection_success",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::RoomUsers(_) => "room_users",
            ServerEvent::WebrtcOffer { .. } => "webrtc_offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ServerEvent::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            ServerEvent::MediaStatusChange { .. } => "media_status_change",
            ServerEvent::Error { .. } => "error",
        }
    }
}
