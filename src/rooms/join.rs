use axum::{Json, debug_handler, extract::State};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;

use crate::{
    AppError, AppResult,
    db::{Room, Store},
    session::{self, SessionIdentity},
};

#[derive(Debug, Deserialize)]
pub(crate) struct JoinQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    room_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedRoom {
    pub room: Room,
    pub user_id: i64,
    pub username: String,
}

/// Resolve an active room for `username`. Nothing is written when the room
/// is missing; live membership starts with the channel's `join_room`.
pub async fn join_existing_room(store: &Store, username: &str, room_id: &str) -> AppResult<JoinedRoom> {
    let username = username.trim();
    let room_id = room_id.trim();
    if username.is_empty() || room_id.is_empty() {
        return Err(AppError::Validation("Username and room ID are required".to_owned()));
    }

    let Some(room) = store.find_active_room(room_id).await? else {
        return Err(AppError::NotFound(format!("Room {room_id} doesn't exist or has ended")));
    };
    let user_id = store.get_or_create_user(username).await?;

    info!(room_id, user_id, "user admitted to room");
    Ok(JoinedRoom {
        room,
        user_id,
        username: username.to_owned(),
    })
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join_room(
    State(store): State<Store>,
    session: Session,

    Json(JoinQuery { username, room_id }): Json<JoinQuery>,
) -> AppResult<Json<JoinedRoom>> {
    let joined = join_existing_room(&store, &username, &room_id).await?;

    let identity = SessionIdentity {
        user_id: joined.user_id,
        username: joined.username.clone(),
    };
    session::remember(&session, &identity, &joined.room.id, &joined.room.name).await?;

    Ok(Json(joined))
}
