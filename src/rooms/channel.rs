//! Per-channel dispatch of inbound events.
//!
//! A [`ChannelContext`] carries what a connection knows about itself: its
//! outbound handle, the identity remembered in the HTTP session and the room
//! it is currently bound to. Every handler takes it explicitly.

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::{db::Store, session::SessionIdentity};

use super::{
    msg::{ClientEvent, JoinRoom, LeaveRoom, ServerEvent},
    presence::{Departure, LeaveReason, ParticipantState, Presence, PresenceError},
    registry::{ConnId, PeerHandle, Registry},
    relay::{Relay, Sender, SignalKind},
};

/// The room a channel is currently bound to, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: String,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug)]
pub struct ChannelContext {
    handle: PeerHandle,
    identity: Option<SessionIdentity>,
    membership: Option<Membership>,
    state: ParticipantState,
}

impl ChannelContext {
    pub fn new(handle: PeerHandle, identity: Option<SessionIdentity>) -> Self {
        Self {
            handle,
            identity,
            membership: None,
            state: ParticipantState::Connected,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.handle.conn_id()
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    fn sender(&self) -> Sender {
        Sender {
            conn_id: self.conn_id(),
            user_id: self.membership.as_ref().map(|m| m.user_id),
        }
    }

    fn reply_error(&self, message: impl Into<String>) {
        self.handle.send(ServerEvent::Error {
            message: message.into(),
        });
    }
}

/// Entry point for everything that arrives over a channel.
#[derive(Clone)]
pub struct Signaling {
    presence: Presence,
    relay: Relay,
    peer_channel_buffer: usize,
}

impl Signaling {
    pub fn new(store: Store, registry: Registry, peer_channel_buffer: usize) -> Self {
        Self {
            presence: Presence::new(store, registry.clone()),
            relay: Relay::new(registry),
            peer_channel_buffer,
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn registry(&self) -> &Registry {
        self.presence.registry()
    }

    /// Register a new channel and greet it with `connection_success`.
    pub fn connect(&self, identity: Option<SessionIdentity>) -> (ChannelContext, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = PeerHandle::channel(self.peer_channel_buffer);
        handle.send(ServerEvent::ConnectionSuccess {
            message: "Connected successfully".to_owned(),
        });
        info!(conn_id = %handle.conn_id(), user_id = identity.as_ref().map(|i| i.user_id), "channel connected");
        (ChannelContext::new(handle, identity), rx)
    }

    pub async fn handle(&self, ctx: &mut ChannelContext, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom(req) => self.join_room(ctx, req).await,
            ClientEvent::LeaveRoom(req) => self.leave_room(ctx, req).await,
            ClientEvent::WebrtcOffer(msg) => {
                self.relay.negotiate(ctx.sender(), SignalKind::Offer, msg).await;
            }
            ClientEvent::WebrtcAnswer(msg) => {
                self.relay.negotiate(ctx.sender(), SignalKind::Answer, msg).await;
            }
            ClientEvent::WebrtcIceCandidate(msg) => {
                self.relay.negotiate(ctx.sender(), SignalKind::IceCandidate, msg).await;
            }
            ClientEvent::MediaStatusChange(msg) => {
                self.relay.media_status(ctx.sender(), msg).await;
            }
        }
    }

    /// Cleanup once the channel is gone. Safe to call more than once.
    pub async fn disconnect(&self, ctx: &mut ChannelContext) -> Option<Departure> {
        let departure = self.release(ctx, LeaveReason::Disconnected).await;
        ctx.state = ParticipantState::Disconnected;
        info!(conn_id = %ctx.conn_id(), "channel disconnected");
        departure
    }

    #[instrument(skip_all, fields(conn_id = %ctx.conn_id(), room_id = req.room_id.as_deref()))]
    async fn join_room(&self, ctx: &mut ChannelContext, req: JoinRoom) {
        let Some(room_id) = trimmed(req.room_id.as_deref()) else {
            warn!("join_room without room_id");
            ctx.reply_error("room_id is required");
            return;
        };
        let room_id = room_id.to_owned();

        // nothing may change for a rejected join, including the current binding
        let identity = match self.admissible(ctx, &room_id, &req).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "join rejected");
                ctx.reply_error(err.client_message());
                return;
            }
        };

        let rebinding = ctx
            .membership
            .as_ref()
            .is_some_and(|m| m.room_id != room_id || m.user_id != identity.user_id);
        if rebinding {
            self.release(ctx, LeaveReason::Left).await;
        }

        ctx.state = ParticipantState::Joining;
        let joined = self
            .presence
            .join(&room_id, identity.user_id, &identity.username, ctx.handle.clone())
            .await;

        match joined {
            Ok(_) => {
                ctx.membership = Some(Membership {
                    room_id,
                    user_id: identity.user_id,
                    username: identity.username,
                });
                ctx.state = ParticipantState::Active;
            }
            Err(err) => {
                warn!(error = %err, "join rejected");
                ctx.reply_error(err.client_message());
                ctx.state = match ctx.membership {
                    Some(_) => ParticipantState::Active,
                    None => ParticipantState::Connected,
                };
            }
        }
    }

    /// Check the room, then settle who is joining. Users are only created
    /// once the room is known to exist.
    async fn admissible(&self, ctx: &ChannelContext, room_id: &str, req: &JoinRoom) -> Result<SessionIdentity, PresenceError> {
        self.presence.validate_room(room_id).await?;
        self.resolve_identity(ctx, req).await
    }

    /// Identity for a join: request fields first, then the session's.
    ///
    /// A given `user_id` must exist and, when a username is sent with it,
    /// belong to that username. A username without an id is looked up (and
    /// created if new).
    async fn resolve_identity(&self, ctx: &ChannelContext, req: &JoinRoom) -> Result<SessionIdentity, PresenceError> {
        let store = self.presence.store();
        let requested = trimmed(req.username.as_deref());

        if let Some(user_id) = req.user_id {
            let Some(user) = store.find_user(user_id).await? else {
                return Err(PresenceError::Validation(format!("Unknown user_id {user_id}")));
            };
            if requested.is_some_and(|name| name != user.username) {
                return Err(PresenceError::Validation(format!(
                    "user_id {user_id} does not belong to that username"
                )));
            }
            return Ok(SessionIdentity {
                user_id,
                username: user.username,
            });
        }

        let session = ctx.identity.as_ref();
        let Some(username) = requested.or(session.map(|s| s.username.as_str())) else {
            return Err(PresenceError::Validation("username is required".to_owned()));
        };

        let user_id = match session.filter(|s| s.username == username) {
            Some(s) => s.user_id,
            None => store.get_or_create_user(username).await?,
        };

        Ok(SessionIdentity {
            user_id,
            username: username.to_owned(),
        })
    }

    #[instrument(skip_all, fields(conn_id = %ctx.conn_id(), room_id = req.room_id.as_deref()))]
    async fn leave_room(&self, ctx: &mut ChannelContext, req: LeaveRoom) {
        let Some(room_id) = trimmed(req.room_id.as_deref()) else {
            warn!("leave_room without room_id");
            return;
        };

        if ctx.membership.as_ref().is_none_or(|m| m.room_id != room_id) {
            debug!("leave_room for a room this channel is not in");
            return;
        }
        self.release(ctx, LeaveReason::Left).await;
        ctx.state = ParticipantState::Left;
    }

    async fn release(&self, ctx: &mut ChannelContext, reason: LeaveReason) -> Option<Departure> {
        let membership = ctx.membership.take()?;
        match reason {
            LeaveReason::Left => self.presence.leave(&membership.room_id, ctx.conn_id()).await,
            LeaveReason::Disconnected => self.presence.disconnect(&membership.room_id, ctx.conn_id()).await,
        }
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
